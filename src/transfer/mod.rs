//! Unified upload/download transfer
//!
//! A [`Transfer`] wraps the I/O endpoint of one file being moved over SFTP,
//! SCP or an exec command. It validates write offsets, enforces the write
//! limit, records the first error, and at close commits or discards atomic
//! uploads and reconciles the user's quota exactly once.

mod copy;

pub use copy::COPY_BUFFER_SIZE;

use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::UploadMode;
use crate::connection::{ActiveTransfer, Connection};
use crate::error::{Result, SftpdError};
use crate::vfs::{CancelFn, FileHandle, Opened};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Maximum number of bytes a transfer may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteLimit {
    Unlimited,
    Bytes(u64),
    /// Quota already exhausted, every write is rejected
    Exceeded,
}

impl WriteLimit {
    /// 0 is unlimited, a negative size means the quota is already exceeded
    pub fn from_size(size: i64) -> Self {
        match size {
            0 => WriteLimit::Unlimited,
            n if n > 0 => WriteLimit::Bytes(n as u64),
            _ => WriteLimit::Exceeded,
        }
    }

    pub fn is_exceeded_by(&self, written: u64) -> bool {
        match self {
            WriteLimit::Unlimited => false,
            WriteLimit::Bytes(max) => written > *max,
            WriteLimit::Exceeded => true,
        }
    }
}

#[derive(Default)]
struct TransferState {
    error: Option<SftpdError>,
    cancel: Option<CancelFn>,
    finished: bool,
}

/// What close did with the written data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Kept,
    TargetRemoved,
    TempDiscarded,
}

pub struct Transfer {
    connection: Arc<Connection>,
    entry: Arc<ActiveTransfer>,
    direction: TransferDirection,
    fs_path: PathBuf,
    file_path: PathBuf,
    virtual_path: String,
    min_write_offset: u64,
    initial_size: i64,
    max_write_size: WriteLimit,
    is_new_file: bool,
    expected_size: Option<u64>,
    read_disabled: bool,
    has_local_file: bool,
    has_endpoint: bool,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    handle: Mutex<Option<Arc<FileHandle>>>,
    state: Mutex<TransferState>,
    close_lock: Mutex<()>,
    start: Instant,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.entry.id)
            .field("direction", &self.direction)
            .field("virtual_path", &self.virtual_path)
            .field("file_path", &self.file_path)
            .field("connection_id", &self.connection.id())
            .finish()
    }
}

/// Builder for [`Transfer`]
pub struct TransferBuilder {
    connection: Arc<Connection>,
    direction: TransferDirection,
    fs_path: PathBuf,
    file_path: Option<PathBuf>,
    virtual_path: String,
    handle: Option<FileHandle>,
    cancel: Option<CancelFn>,
    min_write_offset: u64,
    initial_size: i64,
    max_write_size: WriteLimit,
    is_new_file: bool,
    expected_size: Option<u64>,
    read_disabled: bool,
}

impl TransferBuilder {
    pub fn new(
        connection: Arc<Connection>,
        direction: TransferDirection,
        fs_path: impl Into<PathBuf>,
        virtual_path: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            direction,
            fs_path: fs_path.into(),
            file_path: None,
            virtual_path: virtual_path.into(),
            handle: None,
            cancel: None,
            min_write_offset: 0,
            initial_size: 0,
            max_write_size: WriteLimit::Unlimited,
            is_new_file: false,
            expected_size: None,
            read_disabled: false,
        }
    }

    /// Path actually written, when it differs from the final path
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn opened(mut self, opened: Opened) -> Self {
        self.handle = Some(opened.handle);
        if opened.cancel.is_some() {
            self.cancel = opened.cancel;
        }
        self
    }

    pub fn handle(mut self, handle: FileHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn cancel_fn(mut self, cancel: impl FnOnce() + Send + 'static) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }

    pub fn min_write_offset(mut self, offset: u64) -> Self {
        self.min_write_offset = offset;
        self
    }

    /// Size of the existing content this upload replaces
    pub fn initial_size(mut self, size: i64) -> Self {
        self.initial_size = size;
        self
    }

    pub fn max_write_size(mut self, limit: WriteLimit) -> Self {
        self.max_write_size = limit;
        self
    }

    pub fn new_file(mut self, is_new_file: bool) -> Self {
        self.is_new_file = is_new_file;
        self
    }

    /// Number of bytes the peer announced, checked at close
    pub fn expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// The backend cannot serve ranged reads on this handle
    pub fn read_disabled(mut self) -> Self {
        self.read_disabled = true;
        self
    }

    /// Create the transfer and register it on its connection
    pub fn build(self) -> Transfer {
        let entry = self
            .connection
            .add_transfer(self.direction, &self.virtual_path);
        let has_local_file = matches!(self.handle, Some(FileHandle::File(_)));
        let has_endpoint = self.handle.is_some();
        Transfer {
            entry,
            direction: self.direction,
            file_path: self.file_path.unwrap_or_else(|| self.fs_path.clone()),
            fs_path: self.fs_path,
            virtual_path: self.virtual_path,
            min_write_offset: self.min_write_offset,
            initial_size: self.initial_size,
            max_write_size: self.max_write_size,
            is_new_file: self.is_new_file,
            expected_size: self.expected_size,
            read_disabled: self.read_disabled,
            has_local_file,
            has_endpoint,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            handle: Mutex::new(self.handle.map(Arc::new)),
            state: Mutex::new(TransferState {
                cancel: self.cancel,
                ..Default::default()
            }),
            close_lock: Mutex::new(()),
            start: Instant::now(),
            connection: self.connection,
        }
    }
}

impl Transfer {
    pub fn builder(
        connection: Arc<Connection>,
        direction: TransferDirection,
        fs_path: impl Into<PathBuf>,
        virtual_path: impl Into<String>,
    ) -> TransferBuilder {
        TransferBuilder::new(connection, direction, fs_path, virtual_path)
    }

    pub fn id(&self) -> u64 {
        self.entry.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn fs_path(&self) -> &Path {
        &self.fs_path
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn initial_size(&self) -> i64 {
        self.initial_size
    }

    pub fn max_write_size(&self) -> WriteLimit {
        self.max_write_size
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// The recorded transfer error, if any
    pub fn error(&self) -> Option<SftpdError> {
        self.state.lock().error.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn current_handle(&self) -> Result<Arc<FileHandle>> {
        self.handle.lock().clone().ok_or(SftpdError::TransferClosed)
    }

    fn add_transferred(&self, n: u64) {
        match self.direction {
            TransferDirection::Upload => self.bytes_received.fetch_add(n, Ordering::SeqCst),
            TransferDirection::Download => self.bytes_sent.fetch_add(n, Ordering::SeqCst),
        };
        self.entry.add_bytes(n);
    }

    /// Write `data` at `offset`.
    ///
    /// The offset must not be below the minimum write offset; on backends
    /// without resume support it must also match the current write cursor.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.connection.update_last_activity();
        if self.direction != TransferDirection::Upload {
            return Err(SftpdError::OpUnsupported);
        }
        if self.max_write_size == WriteLimit::Exceeded {
            self.transfer_error(SftpdError::QuotaExceeded);
            return Err(SftpdError::QuotaExceeded);
        }
        let cursor = self.min_write_offset + self.bytes_received();
        let sequential_only = !self.connection.fs().is_upload_resume_supported();
        if offset < self.min_write_offset || (sequential_only && offset != cursor) {
            let expected = if sequential_only { cursor } else { self.min_write_offset };
            let err = SftpdError::InvalidOffset { offset, expected };
            self.transfer_error(err.clone());
            return Err(err);
        }

        let handle = self.current_handle()?;
        let written = match &*handle {
            FileHandle::File(file) => file.write_all_at(data, offset).map(|_| data.len()),
            FileHandle::Writer(writer) => writer.write_at(data, offset),
            FileHandle::Reader(_) => return Err(SftpdError::OpUnsupported),
        };
        let n = match written {
            Ok(n) => n,
            Err(e) => {
                let err = SftpdError::from(e);
                self.transfer_error(err.clone());
                return Err(err);
            }
        };
        self.add_transferred(n as u64);
        if self.max_write_size.is_exceeded_by(self.bytes_received()) {
            self.transfer_error(SftpdError::QuotaExceeded);
            return Err(SftpdError::QuotaExceeded);
        }
        Ok(n)
    }

    /// Read into `buf` from `offset`, 0 means end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.connection.update_last_activity();
        if self.read_disabled {
            return Err(SftpdError::OpUnsupported);
        }
        let handle = self.current_handle()?;
        let read = match &*handle {
            FileHandle::File(file) => file.read_at(buf, offset),
            FileHandle::Reader(reader) => reader.read_at(buf, offset),
            FileHandle::Writer(_) => return Err(SftpdError::OpUnsupported),
        };
        match read {
            Ok(n) => {
                if self.direction == TransferDirection::Download {
                    self.add_transferred(n as u64);
                }
                Ok(n)
            }
            Err(e) => {
                let err = SftpdError::from(e);
                self.transfer_error(err.clone());
                Err(err)
            }
        }
    }

    /// Record `err` as the transfer error unless one is already set.
    ///
    /// The cancel callback, if any, fires on the first error only.
    pub fn transfer_error(&self, err: SftpdError) {
        let cancel = {
            let mut state = self.state.lock();
            if state.error.is_some() {
                return;
            }
            state.error = Some(err.clone());
            state.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel();
        }
        warn!(
            connection_id = %self.connection.id(),
            "unexpected error for transfer, path: {:?}, error: \"{}\", bytes sent: {}, bytes received: {}, running since {} ms",
            self.fs_path,
            err,
            self.bytes_sent(),
            self.bytes_received(),
            self.start.elapsed().as_millis()
        );
    }

    fn close_io(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        match handle.as_deref() {
            None | Some(FileHandle::File(_)) => Ok(()),
            Some(FileHandle::Reader(reader)) => reader.close().map_err(SftpdError::from),
            Some(FileHandle::Writer(writer)) => {
                let result = writer.close();
                if let Err(e) = &result {
                    self.transfer_error(e.clone());
                }
                result
            }
        }
    }

    /// Finish the transfer.
    ///
    /// Closes are serialized; only the first one does any work; later ones
    /// fail with `TransferClosed`. The first recorded transfer error wins
    /// over errors raised while closing.
    pub fn close(&self) -> Result<()> {
        let _serialized = self.close_lock.lock();
        {
            let mut state = self.state.lock();
            if state.finished {
                return Err(SftpdError::TransferClosed);
            }
            state.finished = true;
        }

        let close_result = self.close_io();
        if let (Some(expected), TransferDirection::Upload) = (self.expected_size, self.direction) {
            let received = self.bytes_received();
            if self.error().is_none() && received != expected {
                warn!(
                    connection_id = %self.connection.id(),
                    "size mismatch for {:?}, expected {} bytes, received {}",
                    self.fs_path, expected, received
                );
                self.transfer_error(SftpdError::GenericFailure);
            }
        }

        let transfer_error = self.error();
        let (outcome, finalize_error) = self.finalize_upload(transfer_error.as_ref());
        self.log_completion();
        self.update_quota(outcome, transfer_error.is_some());
        self.connection.remove_transfer(self.entry.id);

        match (transfer_error, finalize_error) {
            (Some(err), _) => {
                warn!(connection_id = %self.connection.id(), "transfer error: {}, path: {:?}", err, self.fs_path);
                Err(err)
            }
            (None, Some(err)) => Err(err),
            (None, None) => close_result,
        }
    }

    /// Commit or discard the written data
    fn finalize_upload(&self, transfer_error: Option<&SftpdError>) -> (Outcome, Option<SftpdError>) {
        if self.direction != TransferDirection::Upload || !self.has_local_file {
            return (Outcome::Kept, None);
        }
        let fs = self.connection.fs();
        let is_atomic = self.file_path != self.fs_path;

        if matches!(transfer_error, Some(SftpdError::QuotaExceeded)) {
            let result = fs.remove(&self.file_path, false);
            warn!(
                connection_id = %self.connection.id(),
                "upload denied due to space limit, delete file: {:?}, deletion error: {:?}",
                self.file_path,
                result.as_ref().err()
            );
            return match result {
                Ok(()) => {
                    self.reset_received();
                    let outcome = if is_atomic {
                        Outcome::TempDiscarded
                    } else {
                        Outcome::TargetRemoved
                    };
                    (outcome, None)
                }
                Err(e) => (Outcome::Kept, Some(e)),
            };
        }

        if !is_atomic {
            return (Outcome::Kept, None);
        }
        let keep_partial = self.connection.upload_mode() == UploadMode::AtomicWithResume;
        if transfer_error.is_none() || keep_partial {
            let result = fs.rename(&self.file_path, &self.fs_path);
            debug!(
                connection_id = %self.connection.id(),
                "atomic upload completed, rename: {:?} -> {:?}, error: {:?}",
                self.file_path,
                self.fs_path,
                result.as_ref().err()
            );
            (Outcome::Kept, result.err())
        } else {
            let result = fs.remove(&self.file_path, false);
            warn!(
                connection_id = %self.connection.id(),
                "atomic upload completed with error: \"{:?}\", delete temporary file: {:?}, deletion error: {:?}",
                transfer_error,
                self.file_path,
                result.as_ref().err()
            );
            match result {
                Ok(()) => {
                    self.reset_received();
                    (Outcome::TempDiscarded, None)
                }
                Err(e) => (Outcome::Kept, Some(e)),
            }
        }
    }

    fn reset_received(&self) {
        self.bytes_received.store(0, Ordering::SeqCst);
        self.entry.reset_bytes();
    }

    fn update_quota(&self, outcome: Outcome, has_error: bool) {
        if self.direction != TransferDirection::Upload || !self.has_endpoint {
            return;
        }
        // a failed pipe upload leaves nothing behind on the backend
        if !self.has_local_file && has_error {
            return;
        }
        let (files, size) = match outcome {
            Outcome::TempDiscarded => return,
            Outcome::TargetRemoved => {
                let files = if self.is_new_file { 0 } else { -1 };
                (files, -(self.initial_size + self.min_write_offset as i64))
            }
            Outcome::Kept => {
                let files = if self.is_new_file { 1 } else { 0 };
                (files, self.bytes_received() as i64 - self.initial_size)
            }
        };
        self.connection.update_quota(files, size);
    }

    fn log_completion(&self) {
        let elapsed = self.start.elapsed().as_millis();
        match self.direction {
            TransferDirection::Upload => info!(
                connection_id = %self.connection.id(),
                username = %self.connection.username(),
                protocol = %self.connection.protocol(),
                "upload {:?} completed in {} ms, bytes received: {}",
                self.fs_path,
                elapsed,
                self.bytes_received()
            ),
            TransferDirection::Download => info!(
                connection_id = %self.connection.id(),
                username = %self.connection.username(),
                protocol = %self.connection.protocol(),
                "download {:?} completed in {} ms, bytes sent: {}",
                self.fs_path,
                elapsed,
                self.bytes_sent()
            ),
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.state.get_mut().finished {
            debug!(connection_id = %self.connection.id(), "transfer {:?} dropped without close", self.fs_path);
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{test_connection, test_user};
    use crate::connection::Protocol;
    use crate::dataprovider::QuotaStore;
    use crate::vfs::mock::MockFs;
    use crate::vfs::{pipe, CreateFlags, Fs, OsFs, PipeReader};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn connection_with_fs(home: &Path, fs: Arc<dyn Fs>, mode: UploadMode) -> Arc<Connection> {
        Arc::new(
            Connection::new("conn_id", Protocol::Sftp, test_user(home), fs, Arc::new(QuotaStore::new()))
                .with_upload_mode(mode),
        )
    }

    fn upload(conn: &Arc<Connection>, path: &Path) -> TransferBuilder {
        let opened = conn.fs().create(path, CreateFlags::default()).unwrap();
        Transfer::builder(conn.clone(), TransferDirection::Upload, path, "/file").opened(opened)
    }

    #[test]
    fn test_write_limit_from_size() {
        assert_eq!(WriteLimit::from_size(0), WriteLimit::Unlimited);
        assert_eq!(WriteLimit::from_size(5), WriteLimit::Bytes(5));
        assert_eq!(WriteLimit::from_size(-1), WriteLimit::Exceeded);
        assert!(!WriteLimit::Bytes(5).is_exceeded_by(5));
        assert!(WriteLimit::Bytes(5).is_exceeded_by(6));
    }

    #[test]
    fn test_invalid_offset_on_sequential_backend() {
        let home = tempdir().unwrap();
        let mut mock = MockFs::new(OsFs::new("conn_id", home.path().to_path_buf(), vec![]));
        mock.resume_supported = false;
        let conn = connection_with_fs(home.path(), Arc::new(mock), UploadMode::Standard);
        let transfer = upload(&conn, &home.path().join("file")).new_file(true).build();

        assert_eq!(transfer.write_at(b"abc", 0).unwrap(), 3);
        let err = transfer.write_at(b"jump", 10).unwrap_err();
        assert!(matches!(err, SftpdError::InvalidOffset { offset: 10, expected: 3 }));
        assert!(err.to_string().contains("Invalid write offset"));
        assert_eq!(transfer.bytes_received(), 3);
        // append at the cursor is still accepted after a rejected write
        assert!(transfer.write_at(b"d", 3).is_ok());

        let close_err = transfer.close().unwrap_err();
        assert!(matches!(close_err, SftpdError::InvalidOffset { .. }));
        assert_eq!(conn.active_transfers_count(), 0);
    }

    #[test]
    fn test_write_below_min_offset() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let transfer = upload(&conn, &home.path().join("file"))
            .min_write_offset(10)
            .build();

        assert!(matches!(
            transfer.write_at(b"data", 0),
            Err(SftpdError::InvalidOffset { offset: 0, expected: 10 })
        ));
        assert!(matches!(transfer.error(), Some(SftpdError::InvalidOffset { .. })));
        assert!(transfer.close().is_err());
        assert_eq!(conn.active_transfers_count(), 0);
    }

    #[test]
    fn test_transfer_error_then_close() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let transfer = upload(&conn, &home.path().join("file"))
            .new_file(true)
            .cancel_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        transfer.transfer_error(SftpdError::Remote("first error".into()));
        transfer.transfer_error(SftpdError::Remote("second error".into()));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let err = transfer.close().unwrap_err();
        assert_eq!(err.to_string(), "first error");
        assert!(matches!(transfer.close(), Err(SftpdError::TransferClosed)));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(conn.active_transfers_count(), 0);
    }

    #[test]
    fn test_atomic_upload_error_discards_temp_file() {
        let home = tempdir().unwrap();
        let fs: Arc<dyn Fs> = Arc::new(OsFs::new("conn_id", home.path().to_path_buf(), vec![]));
        let conn = connection_with_fs(home.path(), fs.clone(), UploadMode::Atomic);
        let target = home.path().join("upload.dat");
        let temp = fs.get_atomic_upload_path(&target);
        let opened = fs.create(&temp, CreateFlags::default()).unwrap();
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Upload, &target, "/upload.dat")
            .file_path(&temp)
            .opened(opened)
            .new_file(true)
            .build();

        transfer.write_at(b"partial", 0).unwrap();
        transfer.transfer_error(SftpdError::io(std::io::ErrorKind::Other, "injected error"));
        let err = transfer.close().unwrap_err();

        assert_eq!(err.to_string(), "injected error");
        assert!(!target.exists());
        assert!(!temp.exists());
        assert_eq!(transfer.bytes_received(), 0);
        assert_eq!(conn.quota_store().get_used_quota("test_user").unwrap().files, 0);
        assert_eq!(conn.active_transfers_count(), 0);
    }

    #[test]
    fn test_atomic_upload_error_keeps_original() {
        let home = tempdir().unwrap();
        let fs: Arc<dyn Fs> = Arc::new(OsFs::new("conn_id", home.path().to_path_buf(), vec![]));
        let conn = connection_with_fs(home.path(), fs.clone(), UploadMode::Atomic);
        let target = home.path().join("existing.dat");
        std::fs::write(&target, b"original").unwrap();
        let temp = fs.get_atomic_upload_path(&target);
        let opened = fs.create(&temp, CreateFlags::default()).unwrap();
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Upload, &target, "/existing.dat")
            .file_path(&temp)
            .opened(opened)
            .initial_size(8)
            .build();

        transfer.write_at(b"new", 0).unwrap();
        transfer.transfer_error(SftpdError::GenericFailure);
        assert!(transfer.close().is_err());
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
        assert!(!temp.exists());
        assert_eq!(conn.quota_store().get_used_quota("test_user").unwrap().size, 0);
    }

    #[test]
    fn test_atomic_upload_commit() {
        let home = tempdir().unwrap();
        let fs: Arc<dyn Fs> = Arc::new(OsFs::new("conn_id", home.path().to_path_buf(), vec![]));
        let conn = connection_with_fs(home.path(), fs.clone(), UploadMode::Atomic);
        let target = home.path().join("upload.dat");
        let temp = fs.get_atomic_upload_path(&target);
        let opened = fs.create(&temp, CreateFlags::default()).unwrap();
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Upload, &target, "/upload.dat")
            .file_path(&temp)
            .opened(opened)
            .new_file(true)
            .expected_size(10)
            .build();

        transfer.write_at(b"01234", 0).unwrap();
        transfer.write_at(b"56789", 5).unwrap();
        transfer.close().unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
        assert!(!temp.exists());
        let usage = conn.quota_store().get_used_quota("test_user").unwrap();
        assert_eq!((usage.files, usage.size), (1, 10));
    }

    #[test]
    fn test_atomic_with_resume_keeps_partial_upload() {
        let home = tempdir().unwrap();
        let fs: Arc<dyn Fs> = Arc::new(OsFs::new("conn_id", home.path().to_path_buf(), vec![]));
        let conn = connection_with_fs(home.path(), fs.clone(), UploadMode::AtomicWithResume);
        let target = home.path().join("upload.dat");
        let temp = fs.get_atomic_upload_path(&target);
        let opened = fs.create(&temp, CreateFlags::default()).unwrap();
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Upload, &target, "/upload.dat")
            .file_path(&temp)
            .opened(opened)
            .new_file(true)
            .build();

        transfer.write_at(b"part", 0).unwrap();
        transfer.transfer_error(SftpdError::GenericFailure);
        assert!(transfer.close().is_err());
        assert_eq!(std::fs::read(&target).unwrap(), b"part");
        assert!(!temp.exists());
    }

    #[test]
    fn test_atomic_rename_error_surfaces() {
        let home = tempdir().unwrap();
        let mock = MockFs::new(OsFs::new("conn_id", home.path().to_path_buf(), vec![]));
        *mock.rename_error.lock() = Some(SftpdError::Remote("rename failed".into()));
        let fs: Arc<dyn Fs> = Arc::new(mock);
        let conn = connection_with_fs(home.path(), fs.clone(), UploadMode::Atomic);
        let target = home.path().join("upload.dat");
        let temp = fs.get_atomic_upload_path(&target);
        let opened = fs.create(&temp, CreateFlags::default()).unwrap();
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Upload, &target, "/upload.dat")
            .file_path(&temp)
            .opened(opened)
            .build();

        let err = transfer.close().unwrap_err();
        assert_eq!(err.to_string(), "rename failed");
        assert_eq!(conn.active_transfers_count(), 0);
    }

    #[test]
    fn test_quota_exceeded_removes_partial_file() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Scp);
        let path = home.path().join("big");
        let transfer = upload(&conn, &path)
            .new_file(true)
            .max_write_size(WriteLimit::Bytes(2))
            .build();

        assert!(matches!(transfer.write_at(b"abc", 0), Err(SftpdError::QuotaExceeded)));
        assert!(matches!(transfer.close(), Err(SftpdError::QuotaExceeded)));
        assert!(!path.exists());
        assert_eq!(transfer.bytes_received(), 0);
        let usage = conn.quota_store().get_used_quota("test_user").unwrap();
        assert_eq!((usage.files, usage.size), (0, 0));
    }

    #[test]
    fn test_exceeded_limit_rejects_first_write() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let transfer = upload(&conn, &home.path().join("f"))
            .max_write_size(WriteLimit::Exceeded)
            .build();
        assert!(matches!(transfer.write_at(b"a", 0), Err(SftpdError::QuotaExceeded)));
        assert_eq!(transfer.bytes_received(), 0);
    }

    #[test]
    fn test_expected_size_mismatch_is_generic_failure() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Scp);
        let transfer = upload(&conn, &home.path().join("short"))
            .new_file(true)
            .expected_size(10)
            .build();
        transfer.write_at(b"12345", 0).unwrap();
        assert!(matches!(transfer.close(), Err(SftpdError::GenericFailure)));
    }

    #[test]
    fn test_existing_file_upload_registration() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        conn.update_quota(1, 123);
        let path = home.path().join("existing");
        std::fs::write(&path, vec![0u8; 123]).unwrap();
        let transfer = upload(&conn, &path).initial_size(123).build();

        assert_eq!(conn.get_transfers().len(), 1);
        assert_eq!(transfer.initial_size(), 123);
        transfer.write_at(b"replaced", 0).unwrap();
        transfer.close().unwrap();

        assert_eq!(conn.active_transfers_count(), 0);
        let usage = conn.quota_store().get_used_quota("test_user").unwrap();
        assert_eq!((usage.files, usage.size), (1, 8));
    }

    #[test]
    fn test_read_disabled() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let transfer = upload(&conn, &home.path().join("f")).read_disabled().build();
        let mut buf = [0u8; 4];
        assert!(matches!(transfer.read_at(&mut buf, 0), Err(SftpdError::OpUnsupported)));
    }

    #[test]
    fn test_download_read_and_closed_handle() {
        let home = tempdir().unwrap();
        let path = home.path().join("download");
        std::fs::write(&path, b"content").unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let opened = conn.fs().open(&path).unwrap();
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Download, &path, "/download")
            .opened(opened)
            .build();

        let mut buf = [0u8; 16];
        let n = transfer.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"content");
        assert_eq!(transfer.read_at(&mut buf, n as u64).unwrap(), 0);
        assert_eq!(transfer.bytes_sent(), 7);
        assert!(matches!(transfer.write_at(b"x", 0), Err(SftpdError::OpUnsupported)));

        transfer.close().unwrap();
        assert!(matches!(transfer.read_at(&mut buf, 0), Err(SftpdError::TransferClosed)));
        assert!(matches!(transfer.close(), Err(SftpdError::TransferClosed)));
    }

    #[test]
    fn test_pipe_reader_error() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let (reader, _writer) = pipe().unwrap();
        reader.close_with_error(SftpdError::Remote("read error".into()));
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Download, "/remote/file", "/file")
            .handle(FileHandle::Reader(Box::new(reader)))
            .build();

        let mut buf = [0u8; 8];
        let err = transfer.read_at(&mut buf, 0).unwrap_err();
        assert_eq!(err.to_string(), "read error");
        assert_eq!(transfer.close().unwrap_err().to_string(), "read error");
        assert_eq!(conn.active_transfers_count(), 0);
    }

    #[test]
    fn test_pipe_writer_done_error_surfaces_on_close() {
        let home = tempdir().unwrap();
        let mock = MockFs::remote(OsFs::new("conn_id", home.path().to_path_buf(), vec![]));
        let conn = connection_with_fs(home.path(), Arc::new(mock), UploadMode::Standard);
        let (reader, writer) = pipe().unwrap();
        let completion = writer.completion();
        let transfer = Transfer::builder(conn.clone(), TransferDirection::Upload, "/remote/file", "/file")
            .handle(FileHandle::Writer(Box::new(writer)))
            .new_file(true)
            .build();

        transfer.write_at(b"data", 0).unwrap();
        let consumer = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            let mut offset = 0;
            loop {
                let n = reader.read_at(&mut buf, offset).unwrap();
                if n == 0 {
                    break;
                }
                offset += n as u64;
            }
            completion.done(Err(SftpdError::Remote("backend upload failed".into())));
            offset
        });

        let err = transfer.close().unwrap_err();
        assert_eq!(err.to_string(), "backend upload failed");
        assert_eq!(consumer.join().unwrap(), 4);
        assert_eq!(conn.active_transfers_count(), 0);
        // nothing reached the backend, quota is untouched
        assert_eq!(conn.quota_store().get_used_quota("test_user").unwrap().files, 0);
    }

    #[test]
    fn test_concurrent_close_runs_once() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Sftp);
        let transfer = Arc::new(upload(&conn, &home.path().join("f")).new_file(true).build());
        transfer.write_at(b"abc", 0).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = transfer.clone();
                std::thread::spawn(move || t.close())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(SftpdError::TransferClosed)))
                .count(),
            3
        );
        let usage = conn.quota_store().get_used_quota("test_user").unwrap();
        assert_eq!((usage.files, usage.size), (1, 3));
    }
}
