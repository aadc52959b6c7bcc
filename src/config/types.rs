//! Configuration Types

use std::time::Duration;

use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ssh::command::SUPPORTED_COMMANDS;

/// How uploads reach their final path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Write directly to the destination file
    #[default]
    Standard,
    /// Write to a temporary file, renamed over the destination on success
    /// and removed on error
    Atomic,
    /// Like `Atomic`, but the temporary file is renamed even on error so
    /// the client can resume the upload
    AtomicWithResume,
}

impl UploadMode {
    pub fn is_atomic(&self) -> bool {
        !matches!(self, UploadMode::Standard)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Address to listen on, empty means all interfaces
    #[serde(default)]
    pub bind_address: String,

    /// Listening port (default: 2022)
    #[serde(default = "default_port")]
    pub bind_port: u16,

    /// Idle timeout in minutes, 0 disables it
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Maximum authentication attempts per connection
    #[serde(default = "default_max_auth_tries")]
    pub max_auth_tries: usize,

    /// Identification banner sent after the version exchange
    #[serde(default = "default_banner")]
    pub banner: String,

    #[serde(default)]
    pub upload_mode: UploadMode,

    /// Private host key paths, relative paths are resolved against the
    /// config dir. Empty means the default RSA, ECDSA and Ed25519 keys.
    #[serde(default)]
    pub host_keys: Vec<String>,

    /// Public keys of CAs trusted to sign user certificates
    #[serde(default)]
    pub trusted_user_ca_keys: Vec<String>,

    /// Exec commands accepted from clients, `*` enables all supported ones
    #[serde(default = "default_enabled_ssh_commands")]
    pub enabled_ssh_commands: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            bind_port: default_port(),
            idle_timeout: default_idle_timeout(),
            max_auth_tries: default_max_auth_tries(),
            banner: default_banner(),
            upload_mode: UploadMode::default(),
            host_keys: Vec::new(),
            trusted_user_ca_keys: Vec::new(),
            enabled_ssh_commands: default_enabled_ssh_commands(),
        }
    }
}

impl Configuration {
    /// Normalize the exec command allow-list.
    ///
    /// `*` expands to every supported command, unknown names are dropped.
    pub fn validate(&mut self) {
        if self.enabled_ssh_commands.iter().any(|c| c == "*") {
            self.enabled_ssh_commands = SUPPORTED_COMMANDS.iter().map(|c| c.to_string()).collect();
            return;
        }
        self.enabled_ssh_commands.retain(|cmd| {
            let supported = SUPPORTED_COMMANDS.contains(&cmd.as_str());
            if !supported {
                warn!("unsupported ssh command {:?} ignored", cmd);
            }
            supported
        });
    }

    pub fn is_ssh_command_enabled(&self, name: &str) -> bool {
        self.enabled_ssh_commands.iter().any(|c| c == name)
    }

    pub fn listen_address(&self) -> String {
        let address = if self.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            self.bind_address.as_str()
        };
        format!("{}:{}", address, self.bind_port)
    }

    /// Transport settings for the SSH server with the loaded host keys
    pub fn russh_config(&self, keys: Vec<PrivateKey>) -> russh::server::Config {
        let inactivity_timeout = match self.idle_timeout {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        };
        russh::server::Config {
            server_id: russh::SshId::Standard(self.banner.clone()),
            keys,
            max_auth_attempts: self.max_auth_tries,
            inactivity_timeout,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        }
    }
}

fn default_port() -> u16 {
    2022
}

fn default_idle_timeout() -> u64 {
    15
}

fn default_max_auth_tries() -> usize {
    6
}

fn default_banner() -> String {
    format!("SSH-2.0-sftpd_{}", env!("CARGO_PKG_VERSION"))
}

fn default_enabled_ssh_commands() -> Vec<String> {
    ["md5sum", "sha1sum", "cd", "pwd", "scp"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}
