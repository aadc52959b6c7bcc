//! SFTP status codes

use std::fmt;

use crate::error::SftpdError;

/// `SSH_FX_*` status codes of the SFTP v3 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl StatusCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Default message sent along with the code
    pub fn message(self) -> &'static str {
        match self {
            StatusCode::Ok => "Success",
            StatusCode::Eof => "End of file",
            StatusCode::NoSuchFile => "No such file or directory",
            StatusCode::PermissionDenied => "Permission denied",
            StatusCode::Failure => "Failure",
            StatusCode::BadMessage => "Bad message",
            StatusCode::NoConnection => "No connection",
            StatusCode::ConnectionLost => "Connection lost",
            StatusCode::OpUnsupported => "Operation unsupported",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<&SftpdError> for StatusCode {
    fn from(err: &SftpdError) -> Self {
        if err.is_not_exist() {
            return StatusCode::NoSuchFile;
        }
        if err.is_permission() {
            return StatusCode::PermissionDenied;
        }
        match err {
            SftpdError::OpUnsupported | SftpdError::UnsupportedConfig => StatusCode::OpUnsupported,
            SftpdError::Syntax(_) | SftpdError::PacketTooLong => StatusCode::BadMessage,
            // path errors come from resolution, the client sees a missing file
            SftpdError::Path(_) => StatusCode::NoSuchFile,
            _ => StatusCode::Failure,
        }
    }
}

impl From<SftpdError> for StatusCode {
    fn from(err: SftpdError) -> Self {
        StatusCode::from(&err)
    }
}
