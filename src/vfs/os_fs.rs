//! Local filesystem backend

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use super::path_utils::{clean_path, clean_relative_path, is_sub_path};
use super::{CreateFlags, FileInfo, Fs, Opened, VirtualFolder};
use crate::error::{Result, SftpdError};

/// Filesystem rooted at the user's home dir, plus mapped virtual folders.
#[derive(Debug, Clone)]
pub struct OsFs {
    connection_id: String,
    root: PathBuf,
    virtual_folders: Vec<VirtualFolder>,
}

impl OsFs {
    pub fn new(connection_id: impl Into<String>, root: PathBuf, virtual_folders: Vec<VirtualFolder>) -> Self {
        Self {
            connection_id: connection_id.into(),
            root,
            virtual_folders,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Real base dir and real path for a cleaned virtual path
    fn map_virtual_path(&self, virtual_path: &str) -> (PathBuf, PathBuf) {
        let folder = self
            .virtual_folders
            .iter()
            .filter(|f| is_sub_path(&f.virtual_path, virtual_path))
            .max_by_key(|f| f.virtual_path.len());
        match folder {
            Some(f) => {
                let rest = virtual_path[f.virtual_path.len()..].trim_start_matches('/');
                let real = if rest.is_empty() {
                    f.mapped_path.clone()
                } else {
                    f.mapped_path.join(rest)
                };
                (f.mapped_path.clone(), real)
            }
            None => {
                let rest = virtual_path.trim_start_matches('/');
                let real = if rest.is_empty() {
                    self.root.clone()
                } else {
                    self.root.join(rest)
                };
                (self.root.clone(), real)
            }
        }
    }

    /// Reject real paths whose nearest existing ancestor resolves, through
    /// symlinks, outside `base`
    fn check_containment(&self, base: &Path, real: &Path) -> Result<()> {
        let canonical_base = match fs::canonicalize(base) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let mut candidate = Some(real);
        while let Some(p) = candidate {
            match fs::canonicalize(p) {
                Ok(resolved) => {
                    if resolved.starts_with(&canonical_base) {
                        return Ok(());
                    }
                    return Err(SftpdError::Path(format!(
                        "{:?} is outside the allowed dir {:?}",
                        real, base
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => candidate = p.parent(),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Fs for OsFs {
    fn name(&self) -> &str {
        "osfs"
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn is_local(&self) -> bool {
        true
    }

    fn is_upload_resume_supported(&self) -> bool {
        true
    }

    fn is_atomic_upload_supported(&self) -> bool {
        true
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let md = fs::metadata(path)?;
        Ok(FileInfo::from_metadata(entry_name(path), &md))
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        let md = fs::symlink_metadata(path)?;
        Ok(FileInfo::from_metadata(entry_name(path), &md))
    }

    fn open(&self, path: &Path) -> Result<Opened> {
        Ok(Opened::file(fs::File::open(path)?))
    }

    fn create(&self, path: &Path, flags: CreateFlags) -> Result<Opened> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .read(flags.read)
            .truncate(flags.truncate)
            .open(path)?;
        Ok(Opened::file(file))
    }

    fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        fs::rename(source, target)?;
        Ok(())
    }

    fn copy_file(&self, source: &Path, target: &Path) -> Result<()> {
        fs::copy(source, target)?;
        Ok(())
    }

    fn remove(&self, path: &Path, is_dir: bool) -> Result<()> {
        if is_dir {
            fs::remove_dir(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path)?;
        Ok(())
    }

    fn symlink(&self, source: &Path, target: &Path) -> Result<()> {
        std::os::unix::fs::symlink(source, target)?;
        Ok(())
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(path)?)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let md = fs::symlink_metadata(entry.path())?;
            entries.push(FileInfo::from_metadata(
                entry.file_name().to_string_lossy(),
                &md,
            ));
        }
        Ok(entries)
    }

    fn resolve_path(&self, virtual_path: &str) -> Result<PathBuf> {
        let clean = if virtual_path.starts_with('/') {
            clean_path(virtual_path)
        } else {
            clean_relative_path(virtual_path).ok_or_else(|| {
                SftpdError::Path(format!("{:?} is outside the home dir", virtual_path))
            })?
        };
        let (base, real) = self.map_virtual_path(&clean);
        self.check_containment(&base, &real)?;
        debug!(connection_id = %self.connection_id, "resolved {:?} -> {:?}", virtual_path, real);
        Ok(real)
    }

    fn get_relative_path(&self, real_path: &Path) -> String {
        let folder = self
            .virtual_folders
            .iter()
            .filter(|f| real_path.starts_with(&f.mapped_path))
            .max_by_key(|f| f.mapped_path.as_os_str().len());
        let (prefix, rest) = match folder {
            Some(f) => (f.virtual_path.as_str(), real_path.strip_prefix(&f.mapped_path)),
            None => ("/", real_path.strip_prefix(&self.root)),
        };
        match rest {
            Ok(rest) => clean_path(&format!("{}/{}", prefix, rest.to_string_lossy())),
            Err(_) => "/".to_string(),
        }
    }

    fn get_atomic_upload_path(&self, real_path: &Path) -> PathBuf {
        let name = entry_name(real_path);
        let tmp_name = format!(".sftpd-upload.{}.{}", uuid::Uuid::new_v4().simple(), name);
        match real_path.parent() {
            Some(dir) => dir.join(tmp_name),
            None => PathBuf::from(tmp_name),
        }
    }

    fn get_dir_size(&self, path: &Path) -> Result<(u64, u64)> {
        let mut files = 0;
        let mut size = 0;
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                files += 1;
                size += entry.metadata()?.len();
            }
        }
        Ok((files, size))
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_path_inside_home() {
        let home = tempdir().unwrap();
        let fs = OsFs::new("conn", home.path().to_path_buf(), vec![]);

        assert_eq!(fs.resolve_path("/").unwrap(), home.path());
        assert_eq!(fs.resolve_path("/a/../b.txt").unwrap(), home.path().join("b.txt"));
        assert_eq!(fs.resolve_path("/../../x").unwrap(), home.path().join("x"));
        assert!(matches!(fs.resolve_path("../upper_path"), Err(SftpdError::Path(_))));
    }

    #[test]
    fn test_resolve_path_rejects_symlink_escape() {
        let home = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), home.path().join("link")).unwrap();
        let fs = OsFs::new("conn", home.path().to_path_buf(), vec![]);

        assert!(matches!(fs.resolve_path("/link/file"), Err(SftpdError::Path(_))));
    }

    #[test]
    fn test_virtual_folder_mapping() {
        let home = tempdir().unwrap();
        let mapped = tempdir().unwrap();
        let fs = OsFs::new(
            "conn",
            home.path().to_path_buf(),
            vec![VirtualFolder {
                virtual_path: "/vdir".to_string(),
                mapped_path: mapped.path().to_path_buf(),
            }],
        );

        let real = fs.resolve_path("/vdir/sub/file").unwrap();
        assert_eq!(real, mapped.path().join("sub/file"));
        assert_eq!(fs.get_relative_path(&real), "/vdir/sub/file");
        assert_eq!(fs.resolve_path("/vdir1").unwrap(), home.path().join("vdir1"));
        assert_eq!(fs.get_relative_path(&home.path().join("a/b")), "/a/b");
        assert_eq!(fs.get_relative_path(home.path()), "/");
    }

    #[test]
    fn test_get_dir_size_skips_symlinks() {
        let home = tempdir().unwrap();
        fs::create_dir(home.path().join("sub")).unwrap();
        fs::write(home.path().join("a"), b"12345").unwrap();
        fs::write(home.path().join("sub/b"), b"123").unwrap();
        std::os::unix::fs::symlink(home.path().join("a"), home.path().join("link")).unwrap();
        let fs = OsFs::new("conn", home.path().to_path_buf(), vec![]);

        assert_eq!(fs.get_dir_size(home.path()).unwrap(), (2, 8));
    }

    #[test]
    fn test_atomic_upload_path_is_sibling() {
        let home = tempdir().unwrap();
        let fs = OsFs::new("conn", home.path().to_path_buf(), vec![]);
        let target = home.path().join("file.dat");
        let tmp = fs.get_atomic_upload_path(&target);
        assert_eq!(tmp.parent(), Some(home.path()));
        assert_ne!(tmp, target);
    }
}
