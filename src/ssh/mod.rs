//! SSH module - exec commands and key material
//!
//! # Features
//! - Exec payload parsing and classification into a closed command set
//! - Checksum commands, external `rsync`/`git` processes, built-in copy/remove
//! - SCP dispatch through the [`crate::scp`] engine
//! - Host key generation/loading and trusted user CAs

mod builtin;
pub mod channel;
pub mod command;
pub mod hash;
pub mod host_keys;
pub mod system;

pub use channel::{CommandChannel, SessionChannel, StderrWriter};
pub use command::{get_dest_path, parse_command_payload, SshCommand, SshCommandKind, SUPPORTED_COMMANDS};
pub use hash::HashAlgorithm;
pub use host_keys::{check_and_load_host_keys, generate_host_key, TrustedCaKeys, DEFAULT_HOST_KEYS};
pub use system::{ProcessSpec, SystemCommand};
