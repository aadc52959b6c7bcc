//! Test filesystem wrapping [`OsFs`] with configurable capabilities and
//! injectable failures.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{CreateFlags, FileInfo, Fs, Opened, OsFs};
use crate::error::{Result, SftpdError};

pub(crate) struct MockFs {
    inner: OsFs,
    pub local: bool,
    pub resume_supported: bool,
    pub atomic_supported: bool,
    pub rename_error: Mutex<Option<SftpdError>>,
    pub open_error: Mutex<Option<SftpdError>>,
    pub remove_error: Mutex<Option<SftpdError>>,
    pub lstat_error: Mutex<Option<SftpdError>>,
    pub walk_error: Mutex<Option<SftpdError>>,
}

impl MockFs {
    pub fn new(inner: OsFs) -> Self {
        Self {
            inner,
            local: true,
            resume_supported: true,
            atomic_supported: true,
            rename_error: Mutex::new(None),
            open_error: Mutex::new(None),
            remove_error: Mutex::new(None),
            lstat_error: Mutex::new(None),
            walk_error: Mutex::new(None),
        }
    }

    pub fn remote(inner: OsFs) -> Self {
        Self {
            local: false,
            resume_supported: false,
            atomic_supported: false,
            ..Self::new(inner)
        }
    }
}

impl Fs for MockFs {
    fn name(&self) -> &str {
        "mockfs"
    }

    fn connection_id(&self) -> &str {
        self.inner.connection_id()
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn is_upload_resume_supported(&self) -> bool {
        self.resume_supported
    }

    fn is_atomic_upload_supported(&self) -> bool {
        self.atomic_supported
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path)
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        if let Some(err) = self.lstat_error.lock().clone() {
            return Err(err);
        }
        self.inner.lstat(path)
    }

    fn open(&self, path: &Path) -> Result<Opened> {
        if let Some(err) = self.open_error.lock().clone() {
            return Err(err);
        }
        self.inner.open(path)
    }

    fn create(&self, path: &Path, flags: CreateFlags) -> Result<Opened> {
        if let Some(err) = self.open_error.lock().clone() {
            return Err(err);
        }
        self.inner.create(path, flags)
    }

    fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        if let Some(err) = self.rename_error.lock().clone() {
            return Err(err);
        }
        self.inner.rename(source, target)
    }

    fn copy_file(&self, source: &Path, target: &Path) -> Result<()> {
        self.inner.copy_file(source, target)
    }

    fn remove(&self, path: &Path, is_dir: bool) -> Result<()> {
        if let Some(err) = self.remove_error.lock().clone() {
            return Err(err);
        }
        self.inner.remove(path, is_dir)
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        self.inner.mkdir(path)
    }

    fn symlink(&self, source: &Path, target: &Path) -> Result<()> {
        self.inner.symlink(source, target)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        self.inner.read_link(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        self.inner.read_dir(path)
    }

    fn resolve_path(&self, virtual_path: &str) -> Result<PathBuf> {
        self.inner.resolve_path(virtual_path)
    }

    fn get_relative_path(&self, real_path: &Path) -> String {
        self.inner.get_relative_path(real_path)
    }

    fn get_atomic_upload_path(&self, real_path: &Path) -> PathBuf {
        self.inner.get_atomic_upload_path(real_path)
    }

    fn get_dir_size(&self, path: &Path) -> Result<(u64, u64)> {
        if let Some(err) = self.walk_error.lock().clone() {
            return Err(err);
        }
        self.inner.get_dir_size(path)
    }
}
