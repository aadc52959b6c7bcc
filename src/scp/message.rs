//! SCP control messages

use std::fmt;

use crate::error::{Result, SftpdError};

/// Confirmation byte: success
pub const SCP_OK: u8 = 0;
/// Confirmation byte: warning, followed by a message line
pub const SCP_WARNING: u8 = 1;
/// Confirmation byte: fatal error, followed by a message line
pub const SCP_ERROR: u8 = 2;

/// Maximum length of a control line
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A control line of the SCP protocol, without the trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpMessage {
    /// `C<mode> <size> <name>`
    File { mode: String, size: u64, name: String },
    /// `D<mode> 0 <name>`
    Dir { mode: String, name: String },
    /// `E`
    EndDir,
    /// `T<mtime> 0 <atime> 0`
    Time { mtime: i64, atime: i64 },
}

impl ScpMessage {
    pub fn parse(line: &str) -> Result<Self> {
        match line.chars().next() {
            Some('C') | Some('D') => parse_upload_message(line),
            Some('E') => Ok(ScpMessage::EndDir),
            Some('T') => parse_time_message(line),
            _ => Err(SftpdError::Syntax(format!(
                "unknown or invalid upload message: {:?}",
                line
            ))),
        }
    }
}

impl fmt::Display for ScpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScpMessage::File { mode, size, name } => write!(f, "C{} {} {}", mode, size, name),
            ScpMessage::Dir { mode, name } => write!(f, "D{} 0 {}", mode, name),
            ScpMessage::EndDir => write!(f, "E"),
            ScpMessage::Time { mtime, atime } => write!(f, "T{} 0 {} 0", mtime, atime),
        }
    }
}

fn parse_upload_message(line: &str) -> Result<ScpMessage> {
    let parts: Vec<&str> = line[1..].splitn(3, ' ').collect();
    if parts.len() != 3 {
        return Err(SftpdError::Syntax(format!("error splitting upload message: {:?}", line)));
    }
    let mode = parts[0];
    if mode.is_empty() || u32::from_str_radix(mode, 8).is_err() {
        return Err(SftpdError::Syntax(format!("invalid mode in upload message: {:?}", line)));
    }
    let size: u64 = parts[1]
        .parse()
        .map_err(|_| SftpdError::Syntax(format!("invalid size in upload message: {:?}", line)))?;
    let name = parts[2];
    if name.is_empty() {
        return Err(SftpdError::Syntax(format!("invalid name in upload message: {:?}", line)));
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(SftpdError::Syntax(format!("invalid file name: {:?}", name)));
    }
    if line.starts_with('C') {
        Ok(ScpMessage::File {
            mode: mode.to_string(),
            size,
            name: name.to_string(),
        })
    } else {
        Ok(ScpMessage::Dir {
            mode: mode.to_string(),
            name: name.to_string(),
        })
    }
}

fn parse_time_message(line: &str) -> Result<ScpMessage> {
    let parts: Vec<&str> = line[1..].split(' ').collect();
    let parse = |s: &str| {
        s.parse::<i64>()
            .map_err(|_| SftpdError::Syntax(format!("invalid time message: {:?}", line)))
    };
    if parts.len() != 4 {
        return Err(SftpdError::Syntax(format!("invalid time message: {:?}", line)));
    }
    Ok(ScpMessage::Time {
        mtime: parse(parts[0])?,
        atime: parse(parts[2])?,
    })
}

/// Wire mode string for a file or directory.
///
/// A zero mode maps to `0755` for directories and `0644` for files. The
/// leading digit adds setuid as 2, setgid as 4 and sticky as 1.
pub fn file_mode_string(mode: u32, is_dir: bool) -> String {
    if mode == 0 {
        return if is_dir { "0755" } else { "0644" }.to_string();
    }
    let mut special = 0;
    if mode & 0o4000 != 0 {
        special += 2;
    }
    if mode & 0o2000 != 0 {
        special += 4;
    }
    if mode & 0o1000 != 0 {
        special += 1;
    }
    format!("{}{:03o}", special, mode & 0o777)
}
