//! User Types

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::vfs::path_utils::{base_name, clean_path, dirs_for_path, is_sub_path, parent_dir};
use crate::vfs::{Fs, OsFs, VirtualFolder};

/// Per-directory permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "*")]
    Any,
    #[serde(rename = "list")]
    ListItems,
    #[serde(rename = "download")]
    Download,
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "overwrite")]
    Overwrite,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "rename")]
    Rename,
    #[serde(rename = "create_dirs")]
    CreateDirs,
    #[serde(rename = "create_symlinks")]
    CreateSymlinks,
    #[serde(rename = "chmod")]
    Chmod,
    #[serde(rename = "chown")]
    Chown,
    #[serde(rename = "chtimes")]
    Chtimes,
}

/// Allowed/denied file extensions for a virtual directory and its children
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionsFilter {
    pub path: String,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub denied_extensions: Vec<String>,
}

impl ExtensionsFilter {
    fn is_allowed(&self, file_name: &str) -> bool {
        let name = file_name.to_lowercase();
        let matches = |ext: &String| name.ends_with(&ext.to_lowercase());
        if self.denied_extensions.iter().any(matches) {
            return false;
        }
        self.allowed_extensions.is_empty() || self.allowed_extensions.iter().any(matches)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFilters {
    #[serde(default)]
    pub file_extensions: Vec<ExtensionsFilter>,
}

/// An authenticated user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub home_dir: PathBuf,

    /// Permissions keyed by virtual directory, inherited by subdirectories
    #[serde(default)]
    pub permissions: HashMap<String, Vec<Permission>>,

    /// Maximum stored bytes, 0 means unlimited
    #[serde(default)]
    pub quota_size: i64,

    /// Maximum stored files, 0 means unlimited
    #[serde(default)]
    pub quota_files: i64,

    #[serde(default)]
    pub used_quota_size: i64,

    #[serde(default)]
    pub used_quota_files: i64,

    /// Maximum size of a single uploaded file, 0 means unlimited
    #[serde(default)]
    pub max_upload_file_size: i64,

    #[serde(default)]
    pub virtual_folders: Vec<VirtualFolder>,

    #[serde(default)]
    pub filters: UserFilters,

    /// Authorized public keys in OpenSSH format
    #[serde(default)]
    pub public_keys: Vec<String>,
}

impl User {
    /// Permissions for the deepest configured directory containing `path`.
    pub fn get_permissions_for_path(&self, path: &str) -> &[Permission] {
        for dir in dirs_for_path(path) {
            if let Some(perms) = self.permissions.get(&dir) {
                return perms;
            }
        }
        &[]
    }

    pub fn has_perm(&self, perm: Permission, path: &str) -> bool {
        let perms = self.get_permissions_for_path(path);
        perms.contains(&Permission::Any) || perms.contains(&perm)
    }

    pub fn has_perms(&self, perms: &[Permission], path: &str) -> bool {
        perms.iter().all(|p| self.has_perm(*p, path))
    }

    /// Check the file name against the extension filter of its directory.
    pub fn is_file_allowed(&self, virtual_path: &str) -> bool {
        let dir = parent_dir(virtual_path);
        let name = base_name(virtual_path);
        for candidate in dirs_for_path(&dir) {
            if let Some(filter) = self
                .filters
                .file_extensions
                .iter()
                .find(|f| clean_path(&f.path) == candidate)
            {
                return filter.is_allowed(&name);
            }
        }
        true
    }

    /// True when an extension filter applies at, above or below `path`.
    pub fn has_filters_overlapping(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.filters.file_extensions.iter().any(|f| {
            let filter_path = clean_path(&f.path);
            is_sub_path(&filter_path, &path) || is_sub_path(&path, &filter_path)
        })
    }

    pub fn is_virtual_folder(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.virtual_folders.iter().any(|f| f.virtual_path == path)
    }

    /// True when a virtual folder lies strictly below `path`.
    pub fn has_virtual_folders_inside(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.virtual_folders
            .iter()
            .any(|f| f.virtual_path != path && is_sub_path(&path, &f.virtual_path))
    }

    /// Deepest virtual folder containing `path`
    pub fn get_virtual_folder_for_path(&self, path: &str) -> Option<&VirtualFolder> {
        let path = clean_path(path);
        self.virtual_folders
            .iter()
            .filter(|f| is_sub_path(&f.virtual_path, &path))
            .max_by_key(|f| f.virtual_path.len())
    }

    /// Virtual folder whose root is exactly `real_path`
    pub fn get_virtual_folder_for_mapped_path(&self, real_path: &Path) -> Option<&VirtualFolder> {
        self.virtual_folders.iter().find(|f| f.mapped_path == real_path)
    }

    pub fn get_filesystem(&self, connection_id: &str) -> Arc<dyn Fs> {
        Arc::new(OsFs::new(
            connection_id,
            self.home_dir.clone(),
            self.virtual_folders.clone(),
        ))
    }

    pub fn is_quota_limited(&self) -> bool {
        self.quota_size > 0 || self.quota_files > 0
    }

    /// `key` matches one of the user's authorized keys, unparsable entries
    /// are skipped
    pub fn is_authorized_key(&self, key: &PublicKey) -> bool {
        self.public_keys.iter().any(|line| match PublicKey::from_openssh(line.trim()) {
            Ok(authorized) => authorized.key_data() == key.key_data(),
            Err(e) => {
                warn!("invalid public key for user {:?}: {}", self.username, e);
                false
            }
        })
    }
}
