//! Built-in `sftpgo-copy` and `sftpgo-remove`

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::command::SshCommand;
use crate::dataprovider::Permission;
use crate::error::{Result, SftpdError};
use crate::vfs::path_utils::{base_name, clean_command_path, is_sub_path, join_virtual_path, parent_dir};
use crate::vfs::FileInfo;

impl SshCommand {
    /// Source and destination virtual paths. A destination ending with `/`
    /// receives the source under its own name.
    fn get_copy_paths(&self) -> Result<(String, String)> {
        if self.args.len() != 2 {
            return Err(SftpdError::Syntax(
                "usage sftpgo-copy <source dir path> <destination dir path>".to_string(),
            ));
        }
        let source = clean_command_path(&self.args[0]);
        let mut dest = clean_command_path(&self.args[1]);
        if dest.ends_with('/') {
            dest = join_virtual_path(&dest, &base_name(&source));
        }
        Ok((source.trim_end_matches('/').to_string(), dest))
    }

    fn get_remove_path(&self) -> Result<String> {
        if self.args.len() != 1 {
            return Err(SftpdError::Syntax("usage sftpgo-remove <destination path>".to_string()));
        }
        let path = clean_command_path(&self.args[0]);
        if path.len() > 1 {
            return Ok(path.trim_end_matches('/').to_string());
        }
        Ok(path)
    }

    /// Permission needed at the parent of `dest` to create `info` there
    fn check_copy_entry(&self, info: &FileInfo, source: &str, dest: &str) -> Result<()> {
        let user = self.connection.user();
        if !user.has_perms(&[Permission::ListItems, Permission::Download], &parent_dir(source)) {
            return Err(SftpdError::PermissionDenied);
        }
        let required = if info.is_dir {
            Permission::CreateDirs
        } else if info.is_symlink {
            Permission::CreateSymlinks
        } else {
            if !user.is_file_allowed(source) || !user.is_file_allowed(dest) {
                return Err(SftpdError::PermissionDenied);
            }
            Permission::Upload
        };
        if !user.has_perm(required, &parent_dir(dest)) {
            return Err(SftpdError::PermissionDenied);
        }
        Ok(())
    }

    /// Check every entry below `fs_source` as it would land below `dest`.
    fn check_recursive_copy_permissions(&self, fs_source: &Path, source: &str, dest: &str) -> Result<()> {
        let fs = self.connection.fs();
        for entry in WalkDir::new(fs_source).follow_links(false).min_depth(1) {
            let entry = entry?;
            let rel = match entry.path().strip_prefix(fs_source) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let info = fs.lstat(entry.path())?;
            self.check_copy_entry(&info, &join_virtual_path(source, &rel), &join_virtual_path(dest, &rel))?;
        }
        Ok(())
    }

    fn check_copy_quota(&self, num_files: u64, files_size: u64) -> Result<()> {
        let quota = self.connection.has_space(true);
        if !quota.has_space {
            return Err(SftpdError::QuotaExceeded);
        }
        if quota.quota_files > 0 && quota.get_remaining_files() < num_files as i64 {
            debug!(
                connection_id = %self.connection.id(),
                "copy not allowed, file limit will be exceeded, remaining files: {}, to copy: {}",
                quota.get_remaining_files(),
                num_files
            );
            return Err(SftpdError::QuotaExceeded);
        }
        if quota.quota_size > 0 && quota.get_remaining_size() < files_size as i64 {
            debug!(
                connection_id = %self.connection.id(),
                "copy not allowed, size limit will be exceeded, remaining size: {}, to copy: {}",
                quota.get_remaining_size(),
                files_size
            );
            return Err(SftpdError::QuotaExceeded);
        }
        Ok(())
    }

    /// `sftpgo-copy <source> <dest>`: recursive copy on the local
    /// filesystem. A failure midway leaves what was copied in place.
    pub(crate) async fn handle_copy(&self) -> Result<()> {
        let fs = self.connection.fs().clone();
        if !fs.is_local() {
            return Err(SftpdError::UnsupportedConfig);
        }
        let (source, dest) = self.get_copy_paths()?;
        let fs_source = fs.resolve_path(&source)?;
        let fs_dest = fs.resolve_path(&dest)?;
        match fs.lstat(&fs_dest) {
            Ok(_) => {
                return Err(SftpdError::Path(format!("destination {:?} already exists", dest)));
            }
            Err(e) if e.is_not_exist() => {}
            Err(e) => return Err(e),
        }
        if source == "/" || is_sub_path(&source, &dest) {
            return Err(SftpdError::Path(format!("cannot copy {:?} inside itself", source)));
        }
        debug!(
            connection_id = %self.connection.id(),
            "requested copy {:?} -> {:?} fs paths {:?} -> {:?}",
            source,
            dest,
            fs_source,
            fs_dest
        );

        let info = fs.lstat(&fs_source)?;
        self.check_copy_entry(&info, &source, &dest)?;
        let user = self.connection.user();
        let (num_files, files_size) = if info.is_dir {
            if user.has_virtual_folders_inside(&source) || user.has_virtual_folders_inside(&dest) {
                return Err(SftpdError::UnsupportedConfig);
            }
            self.check_recursive_copy_permissions(&fs_source, &source, &dest)?;
            fs.get_dir_size(&fs_source)?
        } else if info.is_regular() {
            (1, info.size)
        } else {
            (0, 0)
        };
        self.check_copy_quota(num_files, files_size)?;

        info!(connection_id = %self.connection.id(), "start copy {:?} -> {:?}", fs_source, fs_dest);
        let (from, to) = (fs_source.clone(), fs_dest.clone());
        tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
            .await
            .map_err(|_| SftpdError::GenericFailure)??;
        self.connection.update_quota(num_files as i64, files_size as i64);
        info!(connection_id = %self.connection.id(), "copy {:?} -> {:?} done", fs_source, fs_dest);
        Ok(())
    }

    /// `sftpgo-remove <path>`: recursive delete on the local filesystem.
    pub(crate) async fn handle_remove(&self) -> Result<()> {
        let fs = self.connection.fs().clone();
        if !fs.is_local() {
            return Err(SftpdError::UnsupportedConfig);
        }
        let path = self.get_remove_path()?;
        let user = self.connection.user();
        if !user.has_perm(Permission::Delete, &parent_dir(&path)) {
            return Err(SftpdError::PermissionDenied);
        }
        let fs_path = fs.resolve_path(&path)?;
        let info = fs.lstat(&fs_path)?;
        let (num_files, files_size) = if info.is_dir {
            if path == "/" {
                return Err(SftpdError::Path("removing the root dir is not allowed".to_string()));
            }
            if user.is_virtual_folder(&path) || user.get_virtual_folder_for_mapped_path(&fs_path).is_some() {
                return Err(SftpdError::Path(format!(
                    "removing a directory mapped as virtual folder is not allowed: {:?}",
                    path
                )));
            }
            if user.has_virtual_folders_inside(&path) {
                return Err(SftpdError::Path(format!(
                    "removing a directory with virtual folders inside is not allowed: {:?}",
                    path
                )));
            }
            fs.get_dir_size(&fs_path)?
        } else if info.is_regular() {
            (1, info.size)
        } else {
            (0, 0)
        };

        let target = fs_path.clone();
        let is_dir = info.is_dir;
        tokio::task::spawn_blocking(move || remove_recursive(&target, is_dir))
            .await
            .map_err(|_| SftpdError::GenericFailure)??;
        self.connection.update_quota(-(num_files as i64), -(files_size as i64));
        info!(connection_id = %self.connection.id(), "removed {:?}", fs_path);
        Ok(())
    }
}

/// Copy `source` to `dest` keeping structure, modes and symlinks.
fn copy_recursive(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let target: PathBuf = match entry.path().strip_prefix(source) {
            Ok(rel) if rel.as_os_str().is_empty() => dest.to_path_buf(),
            Ok(rel) => dest.join(rel),
            Err(_) => continue,
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir(&target)?;
            fs::set_permissions(&target, entry.metadata()?.permissions())?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_recursive(path: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}
