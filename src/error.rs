//! Engine error types

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by transfers, protocol handlers and exec commands.
///
/// Cloneable so a transfer can hand the error it recorded mid-stream back
/// to the caller again at close time.
#[derive(Error, Debug, Clone)]
pub enum SftpdError {
    /// Malformed protocol message or command line
    #[error("{0}")]
    Syntax(String),

    #[error("invalid path: {0}")]
    Path(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("denying write due to space limit")]
    QuotaExceeded,

    #[error("operation unsupported")]
    OpUnsupported,

    #[error("unsupported configuration")]
    UnsupportedConfig,

    #[error("Invalid write offset: {offset} minimum valid value: {expected}")]
    InvalidOffset { offset: u64, expected: u64 },

    #[error("transfer already closed")]
    TransferClosed,

    #[error("failure")]
    GenericFailure,

    #[error("short write")]
    ShortWrite,

    #[error("packet too long")]
    PacketTooLong,

    /// Error text received from the peer (SCP confirmation message)
    #[error("{0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Io(Arc<io::Error>),
}

pub type Result<T> = std::result::Result<T, SftpdError>;

impl From<io::Error> for SftpdError {
    fn from(err: io::Error) -> Self {
        SftpdError::Io(Arc::new(err))
    }
}

impl From<walkdir::Error> for SftpdError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io_err) => SftpdError::from(io_err),
            None => SftpdError::Io(Arc::new(io::Error::other("filesystem loop detected"))),
        }
    }
}

impl From<russh::Error> for SftpdError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SftpdError::from(e),
            other => SftpdError::Io(Arc::new(io::Error::other(other.to_string()))),
        }
    }
}

impl From<russh::keys::Error> for SftpdError {
    fn from(err: russh::keys::Error) -> Self {
        SftpdError::Config(err.to_string())
    }
}

impl SftpdError {
    /// Shorthand for an I/O error with a custom message.
    pub fn io(kind: io::ErrorKind, msg: impl Into<String>) -> Self {
        SftpdError::Io(Arc::new(io::Error::new(kind, msg.into())))
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self, SftpdError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    pub fn is_permission(&self) -> bool {
        match self {
            SftpdError::PermissionDenied => true,
            SftpdError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Convert into an `io::Error`, keeping the original kind when possible.
    pub fn into_io(self) -> io::Error {
        match self {
            SftpdError::Io(e) => match Arc::try_unwrap(e) {
                Ok(inner) => inner,
                Err(shared) => io::Error::new(shared.kind(), shared.to_string()),
            },
            SftpdError::PermissionDenied => {
                io::Error::new(io::ErrorKind::PermissionDenied, SftpdError::PermissionDenied.to_string())
            }
            other => io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let err = SftpdError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(err.is_not_exist());
        assert!(!err.is_permission());
        assert_eq!(err.to_string(), "missing");

        let err = SftpdError::io(io::ErrorKind::PermissionDenied, "nope");
        assert!(err.is_permission());
        assert!(SftpdError::PermissionDenied.is_permission());
    }

    #[test]
    fn test_remote_error_keeps_text() {
        let err = SftpdError::Remote("protocol error msg".to_string());
        assert_eq!(err.to_string(), "protocol error msg");
    }

    #[test]
    fn test_into_io_roundtrip_kind() {
        let err = SftpdError::io(io::ErrorKind::UnexpectedEof, "eof");
        let cloned = err.clone();
        assert_eq!(err.into_io().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(cloned.into_io().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(SftpdError::QuotaExceeded.into_io().kind(), io::ErrorKind::Other);
    }
}
