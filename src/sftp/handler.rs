//! SFTP file operations on a connection
//!
//! Maps open/remove/rename/mkdir/stat requests onto the user's filesystem,
//! with the permission, filter and quota checks applied before anything is
//! touched. Opening a file returns a [`Transfer`] the caller keeps for the
//! lifetime of the SFTP handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::dataprovider::Permission;
use crate::error::{Result, SftpdError};
use crate::transfer::{Transfer, TransferDirection};
use crate::vfs::path_utils::{clean_path, parent_dir};
use crate::vfs::{CreateFlags, FileInfo};

pub const SSH_FXF_READ: u32 = 0x0000_0001;
pub const SSH_FXF_WRITE: u32 = 0x0000_0002;
pub const SSH_FXF_APPEND: u32 = 0x0000_0004;
pub const SSH_FXF_CREAT: u32 = 0x0000_0008;
pub const SSH_FXF_TRUNC: u32 = 0x0000_0010;
pub const SSH_FXF_EXCL: u32 = 0x0000_0020;

/// Decoded `pflags` of an open request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn from_bits(pflags: u32) -> Self {
        Self {
            read: pflags & SSH_FXF_READ != 0,
            write: pflags & SSH_FXF_WRITE != 0,
            append: pflags & SSH_FXF_APPEND != 0,
            create: pflags & SSH_FXF_CREAT != 0,
            truncate: pflags & SSH_FXF_TRUNC != 0,
            exclusive: pflags & SSH_FXF_EXCL != 0,
        }
    }

    /// Any flag that modifies the file makes this an upload
    pub fn is_write(&self) -> bool {
        self.write || self.append || self.create || self.truncate
    }

    /// Flags for the backend. Append is dropped: writes land at the offsets
    /// the client sends, which is how resume works.
    pub fn create_flags(&self) -> CreateFlags {
        CreateFlags {
            truncate: self.truncate,
            read: self.read,
        }
    }

    fn is_resume(&self) -> bool {
        self.append && !self.truncate
    }
}

pub struct SftpHandler {
    connection: Arc<Connection>,
}

impl SftpHandler {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn deny(&self, what: &str, virtual_path: &str) -> SftpdError {
        warn!(
            connection_id = %self.connection.id(),
            username = %self.connection.username(),
            "{} not allowed for {:?}",
            what,
            virtual_path
        );
        SftpdError::PermissionDenied
    }

    /// Open `virtual_path` for download
    pub fn open_for_read(&self, virtual_path: &str) -> Result<Transfer> {
        self.connection.update_last_activity();
        let user = self.connection.user();
        if !user.has_perm(Permission::Download, &parent_dir(virtual_path)) {
            return Err(self.deny("download", virtual_path));
        }
        if !user.is_file_allowed(virtual_path) {
            return Err(self.deny("reading file", virtual_path));
        }
        let fs = self.connection.fs();
        let real = fs.resolve_path(virtual_path)?;
        let opened = fs.open(&real).map_err(|e| {
            warn!(connection_id = %self.connection.id(), "could not open file {:?} for reading: {}", real, e);
            e
        })?;
        Ok(
            Transfer::builder(self.connection.clone(), TransferDirection::Download, &real, virtual_path)
                .opened(opened)
                .build(),
        )
    }

    /// Open `virtual_path` for upload, creating, truncating or resuming it
    /// depending on `flags`.
    pub fn open_for_write(&self, virtual_path: &str, flags: OpenFlags) -> Result<Transfer> {
        self.connection.update_last_activity();
        let user = self.connection.user();
        let fs = self.connection.fs();
        if !user.is_file_allowed(virtual_path) {
            return Err(self.deny("writing file", virtual_path));
        }
        let real = fs.resolve_path(virtual_path)?;
        // reading back an upload needs random access to a local file
        let read_disabled = flags.read && !fs.is_local();

        match fs.lstat(&real) {
            Ok(info) if !info.is_symlink => {
                if info.is_dir {
                    warn!(
                        connection_id = %self.connection.id(),
                        "attempted to open a directory for writing: {:?}",
                        real
                    );
                    return Err(SftpdError::OpUnsupported);
                }
                if !user.has_perm(Permission::Overwrite, &parent_dir(virtual_path)) {
                    return Err(self.deny("overwrite", virtual_path));
                }
                self.upload_to_existing_file(flags, &real, virtual_path, info.size, read_disabled)
            }
            Err(e) if !e.is_not_exist() => {
                warn!(connection_id = %self.connection.id(), "error performing file stat {:?}: {}", real, e);
                Err(e)
            }
            // missing file or a symlink replaced by the upload
            _ => {
                if !user.has_perm(Permission::Upload, &parent_dir(virtual_path)) {
                    return Err(self.deny("upload", virtual_path));
                }
                self.upload_to_new_file(flags, &real, virtual_path, read_disabled)
            }
        }
    }

    fn upload_file_path(&self, real: &Path) -> PathBuf {
        if self.connection.is_atomic_upload_enabled() {
            self.connection.fs().get_atomic_upload_path(real)
        } else {
            real.to_path_buf()
        }
    }

    fn upload_to_new_file(
        &self,
        flags: OpenFlags,
        real: &Path,
        virtual_path: &str,
        read_disabled: bool,
    ) -> Result<Transfer> {
        let quota = self.connection.has_space(true);
        if !quota.has_space {
            info!(connection_id = %self.connection.id(), "denying file write due to quota limits");
            return Err(SftpdError::QuotaExceeded);
        }
        let file_path = self.upload_file_path(real);
        let opened = self.connection.fs().create(&file_path, flags.create_flags())?;
        let max_write_size = self.connection.get_max_write_size(&quota, false, 0)?;

        let mut builder = Transfer::builder(self.connection.clone(), TransferDirection::Upload, real, virtual_path)
            .file_path(&file_path)
            .opened(opened)
            .new_file(true)
            .max_write_size(max_write_size);
        if read_disabled {
            builder = builder.read_disabled();
        }
        Ok(builder.build())
    }

    /// A resumed upload keeps the existing bytes and only accepts writes
    /// past them. Anything else replaces the file content.
    fn upload_to_existing_file(
        &self,
        flags: OpenFlags,
        real: &Path,
        virtual_path: &str,
        file_size: u64,
        read_disabled: bool,
    ) -> Result<Transfer> {
        let quota = self.connection.has_space(false);
        if !quota.has_space {
            info!(connection_id = %self.connection.id(), "denying file write due to quota limits");
            return Err(SftpdError::QuotaExceeded);
        }
        let is_resume = flags.is_resume();
        let max_write_size = self
            .connection
            .get_max_write_size(&quota, is_resume, file_size as i64)?;

        let fs = self.connection.fs();
        let file_path = self.upload_file_path(real);
        let mut create_flags = flags.create_flags();
        if file_path != real {
            if flags.truncate {
                create_flags.truncate = true;
            } else {
                // writes continue the current content, the original stays
                // in place until commit
                fs.copy_file(real, &file_path)?;
            }
        }
        let opened = fs.create(&file_path, create_flags)?;

        let (min_write_offset, initial_size) = if is_resume {
            (file_size, 0)
        } else {
            (0, file_size as i64)
        };
        debug!(
            connection_id = %self.connection.id(),
            "upload to existing file {:?}, resume: {}, size: {}",
            real, is_resume, file_size
        );
        let mut builder = Transfer::builder(self.connection.clone(), TransferDirection::Upload, real, virtual_path)
            .file_path(&file_path)
            .opened(opened)
            .min_write_offset(min_write_offset)
            .initial_size(initial_size)
            .max_write_size(max_write_size);
        if read_disabled {
            builder = builder.read_disabled();
        }
        Ok(builder.build())
    }

    /// Remove a file or a symlink
    pub fn remove(&self, virtual_path: &str) -> Result<()> {
        self.connection.update_last_activity();
        let user = self.connection.user();
        if !user.has_perm(Permission::Delete, &parent_dir(virtual_path)) {
            return Err(self.deny("delete", virtual_path));
        }
        let fs = self.connection.fs();
        let real = fs.resolve_path(virtual_path)?;
        let info = fs.lstat(&real)?;
        if info.is_dir {
            warn!(connection_id = %self.connection.id(), "cannot remove {:?}: not a file/symlink", real);
            return Err(SftpdError::GenericFailure);
        }
        if !user.is_file_allowed(virtual_path) {
            return Err(self.deny("removing file", virtual_path));
        }
        fs.remove(&real, false).map_err(|e| {
            warn!(connection_id = %self.connection.id(), "failed to remove {:?}: {}", real, e);
            e
        })?;
        info!(
            connection_id = %self.connection.id(),
            username = %self.connection.username(),
            "file {:?} removed",
            virtual_path
        );
        if !info.is_symlink {
            self.connection.update_quota(-1, -(info.size as i64));
        }
        Ok(())
    }

    fn is_rename_permitted(&self, source: &str, target: &str, info: &FileInfo) -> bool {
        let user = self.connection.user();
        if clean_path(source) == "/" {
            warn!(connection_id = %self.connection.id(), "renaming root dir is not allowed");
            return false;
        }
        if user.is_virtual_folder(source) || user.is_virtual_folder(target) {
            warn!(connection_id = %self.connection.id(), "renaming a virtual folder is not allowed");
            return false;
        }
        if info.is_regular() && (!user.is_file_allowed(source) || !user.is_file_allowed(target)) {
            return false;
        }
        let source_dir = parent_dir(source);
        let target_dir = parent_dir(target);
        if user.has_perm(Permission::Rename, &source_dir) && user.has_perm(Permission::Rename, &target_dir) {
            return true;
        }
        // a rename is also a delete followed by a create
        if !user.has_perm(Permission::Delete, &source_dir) {
            return false;
        }
        let create = if info.is_dir {
            Permission::CreateDirs
        } else if info.is_symlink {
            Permission::CreateSymlinks
        } else {
            Permission::Upload
        };
        user.has_perm(create, &target_dir)
    }

    pub fn rename(&self, source: &str, target: &str) -> Result<()> {
        self.connection.update_last_activity();
        let user = self.connection.user();
        let fs = self.connection.fs();
        let real_source = fs.resolve_path(source)?;
        let real_target = fs.resolve_path(target)?;
        if user.get_virtual_folder_for_mapped_path(&real_source).is_some()
            || user.get_virtual_folder_for_mapped_path(&real_target).is_some()
        {
            return Err(self.deny("renaming a directory mapped as virtual folder", source));
        }
        let info = fs.lstat(&real_source)?;
        if !self.is_rename_permitted(source, target, &info) {
            return Err(self.deny("rename", source));
        }

        let mut replaced_size = None;
        match fs.lstat(&real_target) {
            Ok(target_info) => {
                if target_info.is_dir {
                    warn!(connection_id = %self.connection.id(), "attempted to rename to existing directory {:?}", real_target);
                    return Err(SftpdError::OpUnsupported);
                }
                if !user.has_perm(Permission::Overwrite, &parent_dir(target)) {
                    return Err(self.deny("overwrite", target));
                }
                if target_info.is_regular() {
                    replaced_size = Some(target_info.size);
                }
            }
            Err(e) if !e.is_not_exist() => return Err(e),
            Err(_) => {}
        }
        if info.is_dir && (user.has_virtual_folders_inside(source) || user.has_virtual_folders_inside(target)) {
            warn!(connection_id = %self.connection.id(), "cannot rename a directory with virtual folders inside");
            return Err(SftpdError::OpUnsupported);
        }

        fs.rename(&real_source, &real_target).map_err(|e| {
            warn!(connection_id = %self.connection.id(), "failed to rename {:?} -> {:?}: {}", real_source, real_target, e);
            e
        })?;
        info!(
            connection_id = %self.connection.id(),
            username = %self.connection.username(),
            "renamed {:?} -> {:?}",
            source,
            target
        );
        if let Some(size) = replaced_size {
            self.connection.update_quota(-1, -(size as i64));
        }
        Ok(())
    }

    pub fn mkdir(&self, virtual_path: &str) -> Result<()> {
        self.connection.update_last_activity();
        let user = self.connection.user();
        if !user.has_perm(Permission::CreateDirs, &parent_dir(virtual_path)) {
            return Err(self.deny("mkdir", virtual_path));
        }
        if user.is_virtual_folder(virtual_path) {
            return Err(self.deny("mkdir on a virtual folder", virtual_path));
        }
        let fs = self.connection.fs();
        let real = fs.resolve_path(virtual_path)?;
        fs.mkdir(&real)?;
        debug!(connection_id = %self.connection.id(), "directory {:?} created", virtual_path);
        Ok(())
    }

    /// Attributes of `virtual_path`, following symlinks
    pub fn stat(&self, virtual_path: &str) -> Result<FileInfo> {
        let real = self.list_target(virtual_path)?;
        self.connection.fs().stat(&real)
    }

    pub fn lstat(&self, virtual_path: &str) -> Result<FileInfo> {
        let real = self.list_target(virtual_path)?;
        self.connection.fs().lstat(&real)
    }

    fn list_target(&self, virtual_path: &str) -> Result<PathBuf> {
        self.connection.update_last_activity();
        if !self
            .connection
            .user()
            .has_perm(Permission::ListItems, &parent_dir(virtual_path))
        {
            return Err(self.deny("stat", virtual_path));
        }
        self.connection.fs().resolve_path(virtual_path)
    }

    /// Entries of the directory `virtual_path`
    pub fn list_dir(&self, virtual_path: &str) -> Result<Vec<FileInfo>> {
        self.connection.update_last_activity();
        if !self.connection.user().has_perm(Permission::ListItems, virtual_path) {
            return Err(self.deny("list", virtual_path));
        }
        let fs = self.connection.fs();
        let real = fs.resolve_path(virtual_path)?;
        fs.read_dir(&real)
    }
}
