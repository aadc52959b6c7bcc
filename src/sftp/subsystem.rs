//! SFTP subsystem request loop
//!
//! Reads length-prefixed packets from the subsystem channel, answers each
//! request in order and keeps the open file and directory handles of the
//! session. Handles still open when the channel ends are closed so their
//! transfers are finalized.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, error, info, warn};

use super::codec::SftpPacketCodec;
use super::handler::{OpenFlags, SftpHandler};
use super::packet::{long_name, FileAttributes, NameEntry, Request, Response};
use super::status::StatusCode;
use crate::connection::{ActiveConnections, Connection};
use crate::error::{Result, SftpdError};
use crate::transfer::Transfer;
use crate::vfs::path_utils::clean_path;
use crate::vfs::FileInfo;

/// Largest chunk returned by a single read request
pub const MAX_READ_LENGTH: u32 = 32 * 1024;

enum OpenHandle {
    File(Transfer),
    /// Entries are sent in one batch, then the listing reports EOF
    Dir(Option<Vec<FileInfo>>),
}

pub struct SftpSession {
    handler: SftpHandler,
    handles: HashMap<String, OpenHandle>,
    initialized: bool,
}

impl SftpSession {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            handler: SftpHandler::new(connection),
            handles: HashMap::new(),
            initialized: false,
        }
    }

    fn connection(&self) -> &Arc<Connection> {
        self.handler.connection()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Answer one packet payload.
    ///
    /// A malformed packet or a request before `INIT` is a protocol error
    /// and ends the session. A panic while serving a request is reported
    /// to the client as a failure.
    pub fn handle_packet(&mut self, payload: Bytes) -> Result<Response> {
        let request = Request::parse(payload)?;
        let id = match (self.initialized, request.id()) {
            (_, None) => {
                self.initialized = true;
                return Ok(Response::Version);
            }
            (false, Some(_)) => {
                return Err(SftpdError::Syntax("packet received before init".to_string()));
            }
            (true, Some(id)) => id,
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.handle_request(request))) {
            Ok(response) => Ok(response),
            Err(_) => {
                error!(connection_id = %self.connection().id(), "panic while serving sftp request {}", id);
                Ok(Response::status(id, StatusCode::Failure))
            }
        }
    }

    fn insert_handle(&mut self, handle: OpenHandle) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.handles.insert(id.clone(), handle);
        id
    }

    fn file(&self, handle: &str) -> Result<&Transfer> {
        match self.handles.get(handle) {
            Some(OpenHandle::File(transfer)) => Ok(transfer),
            _ => Err(SftpdError::GenericFailure),
        }
    }

    fn handle_request(&mut self, request: Request) -> Response {
        let id = request.id().unwrap_or_default();
        let result = match request {
            Request::Init { .. } => return Response::Version,
            Request::Open { id, path, pflags } => self
                .open(&path, OpenFlags::from_bits(pflags))
                .map(|handle| Response::Handle { id, handle }),
            Request::Close { id, handle } => self.close(&handle).map(|_| Response::status(id, StatusCode::Ok)),
            Request::Read { id, handle, offset, len } => self.read(id, &handle, offset, len),
            Request::Write {
                id,
                handle,
                offset,
                data,
            } => self
                .file(&handle)
                .and_then(|transfer| transfer.write_at(&data, offset))
                .map(|_| Response::status(id, StatusCode::Ok)),
            Request::Fstat { id, handle } => self
                .file(&handle)
                .and_then(|transfer| self.connection().fs().stat(transfer.file_path()))
                .map(|info| Response::Attrs {
                    id,
                    attrs: FileAttributes::from_info(&info),
                }),
            Request::Stat { id, path } => self.handler.stat(&path).map(|info| Response::Attrs {
                id,
                attrs: FileAttributes::from_info(&info),
            }),
            Request::Lstat { id, path } => self.handler.lstat(&path).map(|info| Response::Attrs {
                id,
                attrs: FileAttributes::from_info(&info),
            }),
            Request::OpenDir { id, path } => self.handler.list_dir(&path).map(|entries| Response::Handle {
                id,
                handle: self.insert_handle(OpenHandle::Dir(Some(entries))),
            }),
            Request::ReadDir { id, handle } => self.read_dir(id, &handle),
            Request::Remove { id, path } => self.handler.remove(&path).map(|_| Response::status(id, StatusCode::Ok)),
            Request::Mkdir { id, path } => self.handler.mkdir(&path).map(|_| Response::status(id, StatusCode::Ok)),
            Request::Rename { id, source, target } => self
                .handler
                .rename(&source, &target)
                .map(|_| Response::status(id, StatusCode::Ok)),
            Request::RealPath { id, path } => {
                let path = clean_path(&path);
                Ok(Response::Name {
                    id,
                    entries: vec![NameEntry {
                        filename: path.clone(),
                        long_name: path,
                        attrs: FileAttributes::default(),
                    }],
                })
            }
            Request::Unsupported { kind, .. } => {
                debug!(connection_id = %self.connection().id(), "unsupported sftp packet type {}", kind);
                Err(SftpdError::OpUnsupported)
            }
        };
        result.unwrap_or_else(|err| {
            debug!(connection_id = %self.connection().id(), "sftp request {} failed: {}", id, err);
            Response::error(id, &err)
        })
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<String> {
        let transfer = if flags.is_write() {
            self.handler.open_for_write(path, flags)?
        } else {
            self.handler.open_for_read(path)?
        };
        Ok(self.insert_handle(OpenHandle::File(transfer)))
    }

    fn close(&mut self, handle: &str) -> Result<()> {
        match self.handles.remove(handle) {
            Some(OpenHandle::File(transfer)) => transfer.close(),
            Some(OpenHandle::Dir(_)) => Ok(()),
            None => Err(SftpdError::GenericFailure),
        }
    }

    fn read(&self, id: u32, handle: &str, offset: u64, len: u32) -> Result<Response> {
        let transfer = self.file(handle)?;
        let mut buf = vec![0u8; len.min(MAX_READ_LENGTH) as usize];
        let n = transfer.read_at(&mut buf, offset)?;
        if n == 0 {
            return Ok(Response::status(id, StatusCode::Eof));
        }
        buf.truncate(n);
        Ok(Response::Data {
            id,
            data: Bytes::from(buf),
        })
    }

    fn read_dir(&mut self, id: u32, handle: &str) -> Result<Response> {
        let owner = self.connection().username().to_string();
        let entries = match self.handles.get_mut(handle) {
            Some(OpenHandle::Dir(entries)) => entries.take(),
            _ => return Err(SftpdError::GenericFailure),
        };
        match entries {
            Some(entries) if !entries.is_empty() => Ok(Response::Name {
                id,
                entries: entries
                    .iter()
                    .map(|info| NameEntry {
                        filename: info.name.clone(),
                        long_name: long_name(info, &owner),
                        attrs: FileAttributes::from_info(info),
                    })
                    .collect(),
            }),
            _ => Ok(Response::status(id, StatusCode::Eof)),
        }
    }

    /// Close every handle left open, finalizing their transfers
    pub fn close_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let OpenHandle::File(transfer) = handle {
                if let Err(e) = transfer.close() {
                    warn!(
                        connection_id = %transfer.connection().id(),
                        "transfer {:?} closed with error at session end: {}",
                        transfer.virtual_path(),
                        e
                    );
                }
            }
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Serve the SFTP subsystem on `stream` until the client closes it.
///
/// The connection is registered as active for the lifetime of the
/// subsystem.
pub async fn serve_subsystem<S>(connection: Arc<Connection>, stream: S, connections: &ActiveConnections) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let _guard = connections.track(connection.clone());
    info!(
        connection_id = %connection.id(),
        username = %connection.username(),
        "sftp subsystem started"
    );
    let (reader, mut writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(reader, SftpPacketCodec);
    let mut session = SftpSession::new(connection.clone());
    let mut codec = SftpPacketCodec;

    let result = async {
        while let Some(frame) = frames.next().await {
            let response = session.handle_packet(frame?.freeze())?;
            let mut out = BytesMut::new();
            codec.encode(response.encode(), &mut out)?;
            writer.write_all(&out).await?;
        }
        writer.flush().await?;
        Ok::<(), SftpdError>(())
    }
    .await;

    session.close_all();
    match &result {
        Ok(()) => debug!(connection_id = %connection.id(), "sftp subsystem ended"),
        Err(e) => warn!(connection_id = %connection.id(), "sftp subsystem ended with error: {}", e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{test_connection, test_user};
    use crate::connection::Protocol;
    use crate::sftp::handler::{SSH_FXF_CREAT, SSH_FXF_READ, SSH_FXF_TRUNC, SSH_FXF_WRITE};
    use crate::sftp::packet::*;
    use bytes::{Buf, BufMut};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn put_string(buf: &mut BytesMut, value: &[u8]) {
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }

    fn init() -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(SSH_FXP_INIT);
        buf.put_u32(SFTP_VERSION);
        buf.freeze()
    }

    fn request(kind: u8, id: u32, build: impl FnOnce(&mut BytesMut)) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(kind);
        buf.put_u32(id);
        build(&mut buf);
        buf.freeze()
    }

    fn open(id: u32, path: &str, pflags: u32) -> Bytes {
        request(SSH_FXP_OPEN, id, |b| {
            put_string(b, path.as_bytes());
            b.put_u32(pflags);
            b.put_u32(0);
        })
    }

    fn with_handle(kind: u8, id: u32, handle: &str) -> Bytes {
        request(kind, id, |b| put_string(b, handle.as_bytes()))
    }

    fn with_path(kind: u8, id: u32, path: &str) -> Bytes {
        request(kind, id, |b| put_string(b, path.as_bytes()))
    }

    fn mkdir(id: u32, path: &str) -> Bytes {
        request(SSH_FXP_MKDIR, id, |b| {
            put_string(b, path.as_bytes());
            b.put_u32(0);
        })
    }

    fn initialized_session(home: &std::path::Path) -> SftpSession {
        let mut session = SftpSession::new(test_connection(test_user(home), Protocol::Sftp));
        assert_eq!(session.handle_packet(init()).unwrap(), Response::Version);
        session
    }

    fn expect_handle(response: Response) -> String {
        match response {
            Response::Handle { handle, .. } => handle,
            other => panic!("unexpected response {:?}", other),
        }
    }

    fn expect_status(response: Response) -> StatusCode {
        match response {
            Response::Status { code, .. } => code,
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_request_before_init() {
        let home = tempdir().unwrap();
        let mut session = SftpSession::new(test_connection(test_user(home.path()), Protocol::Sftp));
        let err = session.handle_packet(with_path(SSH_FXP_STAT, 1, "/")).unwrap_err();
        assert!(matches!(err, SftpdError::Syntax(_)));
    }

    #[test]
    fn test_upload_then_download() {
        let home = tempdir().unwrap();
        let mut session = initialized_session(home.path());
        let conn = session.connection().clone();

        let pflags = SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC;
        let handle = expect_handle(session.handle_packet(open(1, "/file", pflags)).unwrap());
        assert_eq!(conn.active_transfers_count(), 1);
        let write = request(SSH_FXP_WRITE, 2, |b| {
            put_string(b, handle.as_bytes());
            b.put_u64(0);
            put_string(b, b"payload");
        });
        assert_eq!(expect_status(session.handle_packet(write).unwrap()), StatusCode::Ok);
        match session.handle_packet(with_handle(SSH_FXP_FSTAT, 3, &handle)).unwrap() {
            Response::Attrs { attrs, .. } => assert_eq!(attrs.size, Some(7)),
            other => panic!("unexpected response {:?}", other),
        }
        let close = with_handle(SSH_FXP_CLOSE, 4, &handle);
        assert_eq!(expect_status(session.handle_packet(close.clone()).unwrap()), StatusCode::Ok);
        assert_eq!(conn.active_transfers_count(), 0);
        assert_eq!(expect_status(session.handle_packet(close).unwrap()), StatusCode::Failure);

        let handle = expect_handle(session.handle_packet(open(5, "/file", SSH_FXF_READ)).unwrap());
        let read = |id: u32, offset: u64| {
            request(SSH_FXP_READ, id, |b| {
                put_string(b, handle.as_bytes());
                b.put_u64(offset);
                b.put_u32(1024);
            })
        };
        assert_eq!(
            session.handle_packet(read(6, 3)).unwrap(),
            Response::Data {
                id: 6,
                data: Bytes::from_static(b"load")
            }
        );
        assert_eq!(expect_status(session.handle_packet(read(7, 7)).unwrap()), StatusCode::Eof);
        assert_eq!(session.open_handles(), 1);
        session.close_all();
        assert_eq!(session.open_handles(), 0);
        assert_eq!(conn.active_transfers_count(), 0);
    }

    #[test]
    fn test_file_operations() {
        let home = tempdir().unwrap();
        let mut session = initialized_session(home.path());

        assert_eq!(
            expect_status(session.handle_packet(mkdir(1, "/dir")).unwrap()),
            StatusCode::Ok
        );
        std::fs::write(home.path().join("dir/a"), b"abc").unwrap();
        let rename = request(SSH_FXP_RENAME, 2, |b| {
            put_string(b, b"/dir/a");
            put_string(b, b"/dir/b");
        });
        assert_eq!(expect_status(session.handle_packet(rename).unwrap()), StatusCode::Ok);

        let handle = expect_handle(session.handle_packet(with_path(SSH_FXP_OPENDIR, 3, "/dir")).unwrap());
        match session.handle_packet(with_handle(SSH_FXP_READDIR, 4, &handle)).unwrap() {
            Response::Name { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].filename, "b");
                assert!(entries[0].long_name.starts_with("-rw"));
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(
            expect_status(session.handle_packet(with_handle(SSH_FXP_READDIR, 5, &handle)).unwrap()),
            StatusCode::Eof
        );

        assert_eq!(
            expect_status(session.handle_packet(with_path(SSH_FXP_REMOVE, 6, "/dir/b")).unwrap()),
            StatusCode::Ok
        );
        assert_eq!(
            expect_status(session.handle_packet(with_path(SSH_FXP_STAT, 7, "/dir/b")).unwrap()),
            StatusCode::NoSuchFile
        );
        match session.handle_packet(with_path(SSH_FXP_REALPATH, 8, "dir/../x/.")).unwrap() {
            Response::Name { entries, .. } => assert_eq!(entries[0].filename, "/x"),
            other => panic!("unexpected response {:?}", other),
        }
        // setstat is not served
        assert_eq!(
            expect_status(session.handle_packet(with_path(9, 9, "/dir")).unwrap()),
            StatusCode::OpUnsupported
        );
    }

    #[test]
    fn test_open_errors_map_to_status() {
        let home = tempdir().unwrap();
        std::fs::create_dir(home.path().join("dir")).unwrap();
        let mut session = initialized_session(home.path());
        let pflags = SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC;
        assert_eq!(
            expect_status(session.handle_packet(open(1, "/dir", pflags)).unwrap()),
            StatusCode::OpUnsupported
        );
        assert_eq!(
            expect_status(session.handle_packet(open(2, "/missing", SSH_FXF_READ)).unwrap()),
            StatusCode::NoSuchFile
        );
        assert_eq!(session.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_serve_subsystem() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let connections = ActiveConnections::new();
        let (mut client, server) = tokio::io::duplex(64 * 1024);

        let mut codec = SftpPacketCodec;
        let mut out = BytesMut::new();
        codec.encode(init(), &mut out).unwrap();
        codec.encode(with_path(SSH_FXP_STAT, 1, "/"), &mut out).unwrap();
        client.write_all(&out).await.unwrap();
        client.shutdown().await.unwrap();

        serve_subsystem(conn, server, &connections).await.unwrap();
        assert!(connections.is_empty());

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let mut buf = Bytes::from(received);
        let len = buf.get_u32() as usize;
        let version = buf.split_to(len);
        assert_eq!(&version[..], &[SSH_FXP_VERSION, 0, 0, 0, 3]);
        let len = buf.get_u32() as usize;
        let attrs = buf.split_to(len);
        assert_eq!(attrs[0], SSH_FXP_ATTRS);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_packet_too_long() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let connections = ActiveConnections::new();
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();

        let err = serve_subsystem(conn, server, &connections).await.unwrap_err();
        assert_eq!(err.to_string(), "packet too long");
        assert!(connections.is_empty());
    }
}
