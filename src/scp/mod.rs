//! SCP protocol engine
//!
//! Runs the remote side of `scp -t` (upload) and `scp -f` (download) on an
//! exec channel, on top of the transfer layer.

mod command;
pub mod message;

pub use command::ScpCommand;
pub use message::{file_mode_string, ScpMessage};
