//! Duplex channel an exec command runs on

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use russh::server::{Handle, Msg};
use russh::{ChannelId, ChannelStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Writer for the extended data (stderr) stream
pub type StderrWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// The session channel as seen by SCP and exec commands: stdin/stdout as a
/// byte stream plus the stderr stream and the exit status request.
#[async_trait]
pub trait CommandChannel: AsyncRead + AsyncWrite + Unpin + Send {
    /// Stderr writer, handed out once.
    fn take_stderr(&mut self) -> Option<StderrWriter>;

    async fn send_exit_status(&mut self, status: u32) -> io::Result<()>;
}

/// [`CommandChannel`] over a russh server channel
pub struct SessionChannel {
    id: ChannelId,
    stream: Pin<Box<ChannelStream<Msg>>>,
    stderr: Option<StderrWriter>,
    handle: Handle,
}

impl SessionChannel {
    pub fn new(channel: russh::Channel<Msg>, handle: Handle) -> Self {
        let id = channel.id();
        let stderr: StderrWriter = Box::pin(channel.make_writer_ext(Some(1)));
        Self {
            id,
            stream: Box::pin(channel.into_stream()),
            stderr: Some(stderr),
            handle,
        }
    }

    /// Send EOF and close the channel once the command is done
    pub async fn close(self) {
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }
}

impl AsyncRead for SessionChannel {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionChannel {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.stream.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_shutdown(cx)
    }
}

#[async_trait]
impl CommandChannel for SessionChannel {
    fn take_stderr(&mut self) -> Option<StderrWriter> {
        self.stderr.take()
    }

    async fn send_exit_status(&mut self, status: u32) -> io::Result<()> {
        self.handle
            .exit_status_request(self.id, status)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))
    }
}

#[cfg(test)]
pub(crate) use mock::MockChannel;
