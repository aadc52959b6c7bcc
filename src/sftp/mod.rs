//! SFTP module
//!
//! # Features
//! - File operations on a connection: open for read/write with resume and
//!   atomic uploads, remove, rename, mkdir, stat, directory listing
//! - SFTP v3 status codes mapped from engine errors
//! - Length-prefixed packet framing with a packet size ceiling
//! - A request loop serving the subsystem channel

pub mod codec;
pub mod handler;
pub mod packet;
pub mod status;
pub mod subsystem;

pub use codec::{SftpPacketCodec, MAX_PACKET_LENGTH};
pub use handler::{OpenFlags, SftpHandler};
pub use status::StatusCode;
pub use subsystem::{serve_subsystem, SftpSession};
