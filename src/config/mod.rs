//! Configuration Management Module
//!
//! Server configuration: listener, upload mode, host keys, trusted CA keys and
//! the exec command allow-list. Loaded from a JSON file.

pub mod storage;
pub mod types;

pub use storage::{config_dir, default_config_file, ConfigError, ConfigStorage};
pub use types::{Configuration, UploadMode};
