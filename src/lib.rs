//! sftpd - session and transfer engine for an SSH file transfer server
//!
//! Serves SFTP file operations, legacy SCP sessions and a constrained set of
//! SSH exec commands against a virtual filesystem.

pub mod config;
pub mod connection;
pub mod dataprovider;
pub mod error;
pub mod scp;
pub mod server;
pub mod sftp;
pub mod ssh;
pub mod transfer;
pub mod vfs;

pub use config::{Configuration, UploadMode};
pub use connection::{ActiveConnections, Connection, Protocol};
pub use error::{Result, SftpdError};
pub use transfer::{Transfer, TransferDirection, WriteLimit};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, falling back to `info`.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
