//! Per-session connection state
//!
//! A [`Connection`] ties an authenticated user to its filesystem and keeps
//! the registry of transfers in flight on the session.

pub mod registry;

pub use registry::{ActiveConnections, ConnectionGuard, ConnectionStatus, ConnectionTransfer};

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::UploadMode;
use crate::dataprovider::{QuotaStore, User};
use crate::error::{Result, SftpdError};
use crate::transfer::{TransferDirection, WriteLimit};
use crate::vfs::Fs;

/// Protocol a connection was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Protocol {
    #[serde(rename = "SFTP")]
    Sftp,
    #[serde(rename = "SCP")]
    Scp,
    #[serde(rename = "SSH")]
    Ssh,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Sftp => write!(f, "SFTP"),
            Protocol::Scp => write!(f, "SCP"),
            Protocol::Ssh => write!(f, "SSH"),
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaCheckResult {
    pub has_space: bool,
    pub quota_size: i64,
    pub quota_files: i64,
    pub used_size: i64,
    pub used_files: i64,
}

impl QuotaCheckResult {
    /// Bytes left before the size quota is hit, 0 when unlimited
    pub fn get_remaining_size(&self) -> i64 {
        if self.quota_size > 0 {
            self.quota_size - self.used_size
        } else {
            0
        }
    }

    /// Files left before the file quota is hit, 0 when unlimited
    pub fn get_remaining_files(&self) -> i64 {
        if self.quota_files > 0 {
            self.quota_files - self.used_files
        } else {
            0
        }
    }
}

/// Registry entry for a transfer in flight
#[derive(Debug)]
pub struct ActiveTransfer {
    pub id: u64,
    pub direction: TransferDirection,
    pub virtual_path: String,
    pub start_time: DateTime<Utc>,
    bytes: AtomicU64,
}

impl ActiveTransfer {
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_bytes(&self) {
        self.bytes.store(0, Ordering::SeqCst);
    }
}

/// Per-session state
pub struct Connection {
    id: String,
    protocol: Protocol,
    user: User,
    fs: Arc<dyn Fs>,
    quota: Arc<QuotaStore>,
    upload_mode: UploadMode,
    client_version: String,
    remote_address: String,
    start_time: DateTime<Utc>,
    last_activity: AtomicI64,
    command: Mutex<String>,
    transfers: Mutex<Vec<Arc<ActiveTransfer>>>,
    next_transfer_id: AtomicU64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("username", &self.user.username)
            .field("fs", &self.fs.name())
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        protocol: Protocol,
        user: User,
        fs: Arc<dyn Fs>,
        quota: Arc<QuotaStore>,
    ) -> Self {
        quota.register_user(&user);
        let now = Utc::now();
        Self {
            id: id.into(),
            protocol,
            user,
            fs,
            quota,
            upload_mode: UploadMode::default(),
            client_version: String::new(),
            remote_address: String::new(),
            start_time: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            command: Mutex::new(String::new()),
            transfers: Mutex::new(Vec::new()),
            next_transfer_id: AtomicU64::new(1),
        }
    }

    pub fn with_upload_mode(mut self, mode: UploadMode) -> Self {
        self.upload_mode = mode;
        self
    }

    pub fn with_client_info(mut self, client_version: impl Into<String>, remote_address: impl Into<String>) -> Self {
        self.client_version = client_version.into();
        self.remote_address = remote_address.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    pub fn quota_store(&self) -> &Arc<QuotaStore> {
        &self.quota
    }

    pub fn upload_mode(&self) -> UploadMode {
        self.upload_mode
    }

    /// Atomic uploads are configured and the filesystem can do them
    pub fn is_atomic_upload_enabled(&self) -> bool {
        self.upload_mode.is_atomic() && self.fs.is_atomic_upload_supported()
    }

    pub fn update_last_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::SeqCst)).unwrap_or(self.start_time)
    }

    pub fn set_command(&self, command: impl Into<String>) {
        *self.command.lock() = command.into();
    }

    pub fn command(&self) -> String {
        self.command.lock().clone()
    }

    /// Register a new transfer, keeping insertion order
    pub fn add_transfer(&self, direction: TransferDirection, virtual_path: &str) -> Arc<ActiveTransfer> {
        let entry = Arc::new(ActiveTransfer {
            id: self.next_transfer_id.fetch_add(1, Ordering::SeqCst),
            direction,
            virtual_path: virtual_path.to_string(),
            start_time: Utc::now(),
            bytes: AtomicU64::new(0),
        });
        self.transfers.lock().push(entry.clone());
        debug!(connection_id = %self.id, "transfer {} added for {:?}", entry.id, virtual_path);
        entry
    }

    pub fn remove_transfer(&self, id: u64) -> bool {
        let mut transfers = self.transfers.lock();
        match transfers.iter().position(|t| t.id == id) {
            Some(idx) => {
                transfers.remove(idx);
                debug!(connection_id = %self.id, "transfer {} removed", id);
                true
            }
            None => false,
        }
    }

    pub fn active_transfers_count(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn get_transfers(&self) -> Vec<ConnectionTransfer> {
        self.transfers
            .lock()
            .iter()
            .map(|t| ConnectionTransfer {
                id: t.id,
                direction: t.direction,
                start_time: t.start_time,
                size: t.bytes(),
                virtual_path: t.virtual_path.clone(),
            })
            .collect()
    }

    /// Check the user's quota before accepting new data.
    ///
    /// `check_files` also enforces the file count, used when the operation
    /// may create new files.
    pub fn has_space(&self, check_files: bool) -> QuotaCheckResult {
        let mut result = QuotaCheckResult {
            has_space: true,
            quota_size: self.user.quota_size,
            quota_files: self.user.quota_files,
            ..Default::default()
        };
        if !self.user.is_quota_limited() {
            return result;
        }
        let usage = match self.quota.get_used_quota(&self.user.username) {
            Some(usage) => usage,
            None => {
                result.has_space = false;
                return result;
            }
        };
        result.used_files = usage.files;
        result.used_size = usage.size;
        if (check_files && result.quota_files > 0 && result.used_files >= result.quota_files)
            || (result.quota_size > 0 && result.used_size >= result.quota_size)
        {
            debug!(
                connection_id = %self.id,
                "quota exceeded for user {:?}, used files {}/{}, used size {}/{}",
                self.user.username, result.used_files, result.quota_files, result.used_size, result.quota_size
            );
            result.has_space = false;
        }
        result
    }

    /// Write limit for an upload given the quota and the max file size.
    ///
    /// `file_size` is the current size of the target: on resume it is kept
    /// and counts against the max file size, otherwise it is replaced and
    /// frees that much quota.
    pub fn get_max_write_size(&self, quota: &QuotaCheckResult, is_resume: bool, file_size: i64) -> Result<WriteLimit> {
        let mut max_write_size = quota.get_remaining_size();
        let max_upload = self.user.max_upload_file_size;
        if is_resume {
            if !self.fs.is_upload_resume_supported() {
                return Err(SftpdError::OpUnsupported);
            }
            if max_upload > 0 && max_upload <= file_size {
                return Err(SftpdError::QuotaExceeded);
            }
            if max_upload > 0 {
                let remaining_upload = max_upload - file_size;
                if remaining_upload < max_write_size || max_write_size == 0 {
                    max_write_size = remaining_upload;
                }
            }
        } else {
            if max_write_size > 0 {
                max_write_size += file_size;
            }
            if max_upload > 0 && (max_upload < max_write_size || max_write_size == 0) {
                max_write_size = max_upload;
            }
        }
        Ok(WriteLimit::from_size(max_write_size))
    }

    pub fn update_quota(&self, files: i64, size: i64) {
        if files == 0 && size == 0 {
            return;
        }
        self.quota.update_quota(&self.user.username, files, size);
    }

    pub fn get_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            username: self.user.username.clone(),
            connection_id: self.id.clone(),
            client_version: self.client_version.clone(),
            remote_address: self.remote_address.clone(),
            connection_time: self.start_time,
            last_activity: self.last_activity(),
            protocol: self.protocol,
            command: self.command(),
            transfers: self.get_transfers(),
        }
    }
}
