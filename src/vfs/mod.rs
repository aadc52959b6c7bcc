//! Virtual filesystem
//!
//! Protocol handlers talk to storage through the [`Fs`] capability trait.
//! Transfers branch only on the capability flags it reports, never on the
//! backend identity.

#[cfg(test)]
pub(crate) mod mock;
pub mod os_fs;
pub mod path_utils;
pub mod pipe;

pub use os_fs::OsFs;
pub use pipe::{pipe, FilePipeReader, FilePipeWriter, PipeCompletion, PipeReader, PipeWriter};

use std::fs::{File, Metadata};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Invoked when a transfer ends in error, lets the backend abort its side.
pub type CancelFn = Box<dyn FnOnce() + Send>;

/// Attributes of a filesystem entry
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Permission bits including setuid, setgid and sticky
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl FileInfo {
    pub fn from_metadata(name: impl Into<String>, md: &Metadata) -> Self {
        Self {
            name: name.into(),
            size: md.len(),
            mode: md.permissions().mode() & 0o7777,
            is_dir: md.is_dir(),
            is_symlink: md.file_type().is_symlink(),
            modified: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            accessed: md.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }

    pub fn is_regular(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }
}

/// Maps a virtual path prefix onto a separate real directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFolder {
    pub virtual_path: String,
    pub mapped_path: PathBuf,
}

/// I/O endpoint backing a transfer
pub enum FileHandle {
    File(File),
    Reader(Box<dyn PipeReader>),
    Writer(Box<dyn PipeWriter>),
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileHandle::File(file) => f.debug_tuple("File").field(file).finish(),
            FileHandle::Reader(_) => f.write_str("Reader"),
            FileHandle::Writer(_) => f.write_str("Writer"),
        }
    }
}

/// Result of [`Fs::open`] and [`Fs::create`]
pub struct Opened {
    pub handle: FileHandle,
    pub cancel: Option<CancelFn>,
}

impl Opened {
    pub fn file(file: File) -> Self {
        Self {
            handle: FileHandle::File(file),
            cancel: None,
        }
    }
}

/// Flags for [`Fs::create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateFlags {
    pub truncate: bool,
    pub read: bool,
}

impl Default for CreateFlags {
    fn default() -> Self {
        Self {
            truncate: true,
            read: false,
        }
    }
}

/// Filesystem capability interface
pub trait Fs: Send + Sync {
    fn name(&self) -> &str;

    fn connection_id(&self) -> &str;

    /// Backed by the local disk, so external processes can operate on it
    fn is_local(&self) -> bool;

    /// Uploads can continue at an arbitrary offset
    fn is_upload_resume_supported(&self) -> bool;

    /// Uploads can go through a temporary file renamed on completion
    fn is_atomic_upload_supported(&self) -> bool;

    fn stat(&self, path: &Path) -> Result<FileInfo>;

    fn lstat(&self, path: &Path) -> Result<FileInfo>;

    /// Open for reading
    fn open(&self, path: &Path) -> Result<Opened>;

    /// Open for writing, creating the file if needed
    fn create(&self, path: &Path, flags: CreateFlags) -> Result<Opened>;

    fn rename(&self, source: &Path, target: &Path) -> Result<()>;

    /// Copy the content of a regular file, replacing `target`
    fn copy_file(&self, source: &Path, target: &Path) -> Result<()>;

    fn remove(&self, path: &Path, is_dir: bool) -> Result<()>;

    fn mkdir(&self, path: &Path) -> Result<()>;

    fn symlink(&self, source: &Path, target: &Path) -> Result<()>;

    fn read_link(&self, path: &Path) -> Result<PathBuf>;

    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>>;

    /// Map a virtual path to the real path, rejecting anything that
    /// escapes the home dir or the mapped virtual folders
    fn resolve_path(&self, virtual_path: &str) -> Result<PathBuf>;

    /// Inverse of `resolve_path`
    fn get_relative_path(&self, real_path: &Path) -> String;

    /// Temporary path used for atomic uploads to `real_path`
    fn get_atomic_upload_path(&self, real_path: &Path) -> PathBuf;

    /// Number of regular files and their total size below `path`,
    /// symlinks are not followed nor counted
    fn get_dir_size(&self, path: &Path) -> Result<(u64, u64)>;
}
