//! File-backed pipes
//!
//! Connect a transfer to a backend that consumes or produces a byte stream
//! instead of a random-access file. Data is spooled through an anonymous
//! temporary file: the writer appends sequentially, the reader can read at
//! any offset already written and blocks for offsets not yet available.
//!
//! For uploads the consumer reports its outcome through [`PipeCompletion`];
//! closing the writer waits for that outcome and returns it.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SftpdError};

/// Read end of a pipe, served to downloads.
pub trait PipeReader: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn close(&self) -> io::Result<()>;
}

/// Write end of a pipe, fed by uploads.
pub trait PipeWriter: Send + Sync {
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;

    /// Close the write end and wait for the consumer's result.
    fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct State {
    written: u64,
    writer_closed: bool,
    reader_closed: bool,
    error: Option<SftpdError>,
    done: Option<Result<()>>,
}

struct Shared {
    file: File,
    state: Mutex<State>,
    cond: Condvar,
}

/// Create a new pipe spooled through an anonymous temporary file.
pub fn pipe() -> io::Result<(FilePipeReader, FilePipeWriter)> {
    let shared = Arc::new(Shared {
        file: tempfile::tempfile()?,
        state: Mutex::new(State::default()),
        cond: Condvar::new(),
    });
    Ok((
        FilePipeReader {
            shared: shared.clone(),
        },
        FilePipeWriter { shared },
    ))
}

pub struct FilePipeReader {
    shared: Arc<Shared>,
}

impl FilePipeReader {
    /// Close the read end, making pending and future operations on both
    /// ends fail with `err`.
    pub fn close_with_error(&self, err: SftpdError) {
        let mut state = self.shared.state.lock();
        state.error.get_or_insert(err);
        state.reader_closed = true;
        self.shared.cond.notify_all();
    }
}

impl PipeReader for FilePipeReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(err) = &state.error {
                return Err(err.clone().into_io());
            }
            if state.reader_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "read from closed pipe"));
            }
            if offset < state.written {
                break;
            }
            if state.writer_closed {
                return Ok(0);
            }
            self.shared.cond.wait(&mut state);
        }
        let available = (state.written - offset).min(buf.len() as u64) as usize;
        drop(state);
        self.shared.file.read_at(&mut buf[..available], offset)
    }

    fn close(&self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        state.reader_closed = true;
        self.shared.cond.notify_all();
        Ok(())
    }
}

impl Drop for FilePipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.reader_closed = true;
        self.shared.cond.notify_all();
    }
}

pub struct FilePipeWriter {
    shared: Arc<Shared>,
}

impl FilePipeWriter {
    /// Handle the consumer uses to report the upload outcome.
    pub fn completion(&self) -> PipeCompletion {
        PipeCompletion {
            shared: self.shared.clone(),
        }
    }

    /// Close the write end with an error that readers will observe.
    pub fn close_with_error(&self, err: SftpdError) {
        let mut state = self.shared.state.lock();
        state.error.get_or_insert(err);
        state.writer_closed = true;
        self.shared.cond.notify_all();
    }
}

impl PipeWriter for FilePipeWriter {
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        {
            let state = self.shared.state.lock();
            if let Some(err) = &state.error {
                return Err(err.clone().into_io());
            }
            if state.reader_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write to closed pipe"));
            }
            if state.writer_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer already closed"));
            }
            if offset != state.written {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("non sequential write at offset {}, expected {}", offset, state.written),
                ));
            }
        }
        self.shared.file.write_all_at(data, offset)?;
        let mut state = self.shared.state.lock();
        state.written += data.len() as u64;
        self.shared.cond.notify_all();
        Ok(data.len())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.writer_closed = true;
        self.shared.cond.notify_all();
        while state.done.is_none() && !state.reader_closed {
            self.shared.cond.wait(&mut state);
        }
        state.done.clone().unwrap_or(Ok(()))
    }
}

/// Completion signal for an upload pipe.
#[derive(Clone)]
pub struct PipeCompletion {
    shared: Arc<Shared>,
}

impl PipeCompletion {
    pub fn done(&self, result: Result<()>) {
        let mut state = self.shared.state.lock();
        state.done = Some(result);
        self.shared.cond.notify_all();
    }
}
