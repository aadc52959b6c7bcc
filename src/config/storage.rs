//! Configuration Storage
//!
//! Reads the server configuration file from disk.
//! Default location: `<config dir>/sftpd/sftpd.json`

use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::Configuration;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the sftpd configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("sftpd"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Get the default configuration file path
pub fn default_config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("sftpd.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: default_config_file()?,
        })
    }

    /// Create storage manager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load configuration from disk
    ///
    /// A missing file yields the default configuration. A file that does
    /// not parse is an error: the server must not start with a config it
    /// did not understand.
    pub async fn load(&self) -> Result<Configuration, ConfigError> {
        let mut config = match fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str::<Configuration>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("config file {:?} not found, using defaults", self.path);
                Configuration::default()
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        config.validate();
        Ok(config)
    }

    /// Directory that relative host key and CA paths are resolved against
    pub fn config_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
