//! SFTP v3 requests and responses
//!
//! Only the subset of packets served by the subsystem is decoded, anything
//! else is answered with `OpUnsupported`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::status::StatusCode;
use crate::error::{Result, SftpdError};
use crate::vfs::FileInfo;

pub const SFTP_VERSION: u32 = 3;

pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;

const ATTR_SIZE: u32 = 0x0000_0001;
const ATTR_UIDGID: u32 = 0x0000_0002;
const ATTR_PERMISSIONS: u32 = 0x0000_0004;
const ATTR_ACMODTIME: u32 = 0x0000_0008;
const ATTR_EXTENDED: u32 = 0x8000_0000;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Init { version: u32 },
    Open { id: u32, path: String, pflags: u32 },
    Close { id: u32, handle: String },
    Read { id: u32, handle: String, offset: u64, len: u32 },
    Write { id: u32, handle: String, offset: u64, data: Bytes },
    Lstat { id: u32, path: String },
    Fstat { id: u32, handle: String },
    OpenDir { id: u32, path: String },
    ReadDir { id: u32, handle: String },
    Remove { id: u32, path: String },
    Mkdir { id: u32, path: String },
    RealPath { id: u32, path: String },
    Stat { id: u32, path: String },
    Rename { id: u32, source: String, target: String },
    Unsupported { id: u32, kind: u8 },
}

fn short_packet() -> SftpdError {
    SftpdError::Syntax("short packet".to_string())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(short_packet());
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(short_packet());
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(short_packet());
    }
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(short_packet());
    }
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| SftpdError::Syntax("invalid utf-8 string".to_string()))
}

/// Consume an attribute block, the values are not used
fn skip_attrs(buf: &mut Bytes) -> Result<()> {
    let flags = get_u32(buf)?;
    if flags & ATTR_SIZE != 0 {
        get_u64(buf)?;
    }
    if flags & ATTR_UIDGID != 0 {
        get_u32(buf)?;
        get_u32(buf)?;
    }
    if flags & ATTR_PERMISSIONS != 0 {
        get_u32(buf)?;
    }
    if flags & ATTR_ACMODTIME != 0 {
        get_u32(buf)?;
        get_u32(buf)?;
    }
    if flags & ATTR_EXTENDED != 0 {
        let count = get_u32(buf)?;
        for _ in 0..count {
            get_bytes(buf)?;
            get_bytes(buf)?;
        }
    }
    Ok(())
}

impl Request {
    /// Decode a packet payload, type byte included
    pub fn parse(mut payload: Bytes) -> Result<Self> {
        let kind = get_u8(&mut payload)?;
        if kind == SSH_FXP_INIT {
            return Ok(Request::Init {
                version: get_u32(&mut payload)?,
            });
        }
        let id = get_u32(&mut payload)?;
        let buf = &mut payload;
        let request = match kind {
            SSH_FXP_OPEN => {
                let path = get_string(buf)?;
                let pflags = get_u32(buf)?;
                skip_attrs(buf)?;
                Request::Open { id, path, pflags }
            }
            SSH_FXP_CLOSE => Request::Close {
                id,
                handle: get_string(buf)?,
            },
            SSH_FXP_READ => Request::Read {
                id,
                handle: get_string(buf)?,
                offset: get_u64(buf)?,
                len: get_u32(buf)?,
            },
            SSH_FXP_WRITE => Request::Write {
                id,
                handle: get_string(buf)?,
                offset: get_u64(buf)?,
                data: get_bytes(buf)?,
            },
            SSH_FXP_LSTAT => Request::Lstat {
                id,
                path: get_string(buf)?,
            },
            SSH_FXP_FSTAT => Request::Fstat {
                id,
                handle: get_string(buf)?,
            },
            SSH_FXP_OPENDIR => Request::OpenDir {
                id,
                path: get_string(buf)?,
            },
            SSH_FXP_READDIR => Request::ReadDir {
                id,
                handle: get_string(buf)?,
            },
            SSH_FXP_REMOVE => Request::Remove {
                id,
                path: get_string(buf)?,
            },
            SSH_FXP_MKDIR => {
                let path = get_string(buf)?;
                skip_attrs(buf)?;
                Request::Mkdir { id, path }
            }
            SSH_FXP_REALPATH => Request::RealPath {
                id,
                path: get_string(buf)?,
            },
            SSH_FXP_STAT => Request::Stat {
                id,
                path: get_string(buf)?,
            },
            SSH_FXP_RENAME => Request::Rename {
                id,
                source: get_string(buf)?,
                target: get_string(buf)?,
            },
            kind => Request::Unsupported { id, kind },
        };
        Ok(request)
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            Request::Init { .. } => None,
            Request::Open { id, .. }
            | Request::Close { id, .. }
            | Request::Read { id, .. }
            | Request::Write { id, .. }
            | Request::Lstat { id, .. }
            | Request::Fstat { id, .. }
            | Request::OpenDir { id, .. }
            | Request::ReadDir { id, .. }
            | Request::Remove { id, .. }
            | Request::Mkdir { id, .. }
            | Request::RealPath { id, .. }
            | Request::Stat { id, .. }
            | Request::Rename { id, .. }
            | Request::Unsupported { id, .. } => Some(*id),
        }
    }
}

fn unix_secs(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

/// Attribute block sent in NAME and ATTRS responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub permissions: Option<u32>,
    pub times: Option<(u32, u32)>,
}

impl FileAttributes {
    pub fn from_info(info: &FileInfo) -> Self {
        let file_type = if info.is_symlink {
            S_IFLNK
        } else if info.is_dir {
            S_IFDIR
        } else {
            S_IFREG
        };
        Self {
            size: Some(info.size),
            permissions: Some(file_type | info.mode),
            times: Some((unix_secs(info.accessed), unix_secs(info.modified))),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= ATTR_SIZE;
        }
        if self.permissions.is_some() {
            flags |= ATTR_PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= ATTR_ACMODTIME;
        }
        dst.put_u32(flags);
        if let Some(size) = self.size {
            dst.put_u64(size);
        }
        if let Some(permissions) = self.permissions {
            dst.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.times {
            dst.put_u32(atime);
            dst.put_u32(mtime);
        }
    }
}

/// `ls -l` style line for a directory entry
pub fn long_name(info: &FileInfo, owner: &str) -> String {
    let mut mode = String::with_capacity(10);
    mode.push(if info.is_symlink {
        'l'
    } else if info.is_dir {
        'd'
    } else {
        '-'
    });
    for (i, c) in "rwxrwxrwx".chars().enumerate() {
        mode.push(if info.mode & (1 << (8 - i)) != 0 { c } else { '-' });
    }
    let modified: DateTime<Utc> = info.modified.into();
    format!(
        "{} 1 {:<8} {:<8} {:>8} {} {}",
        mode,
        owner,
        owner,
        info.size,
        modified.format("%b %d %H:%M"),
        info.name
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub long_name: String,
    pub attrs: FileAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version,
    Status { id: u32, code: StatusCode, message: String },
    Handle { id: u32, handle: String },
    Data { id: u32, data: Bytes },
    Name { id: u32, entries: Vec<NameEntry> },
    Attrs { id: u32, attrs: FileAttributes },
}

fn put_string(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

impl Response {
    pub fn status(id: u32, code: StatusCode) -> Self {
        Response::Status {
            id,
            code,
            message: code.message().to_string(),
        }
    }

    pub fn error(id: u32, err: &SftpdError) -> Self {
        Response::Status {
            id,
            code: StatusCode::from(err),
            message: err.to_string(),
        }
    }

    /// Payload of the response packet, type byte included
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        match self {
            Response::Version => {
                dst.put_u8(SSH_FXP_VERSION);
                dst.put_u32(SFTP_VERSION);
            }
            Response::Status { id, code, message } => {
                dst.put_u8(SSH_FXP_STATUS);
                dst.put_u32(*id);
                dst.put_u32(code.as_u32());
                put_string(&mut dst, message.as_bytes());
                put_string(&mut dst, b"en");
            }
            Response::Handle { id, handle } => {
                dst.put_u8(SSH_FXP_HANDLE);
                dst.put_u32(*id);
                put_string(&mut dst, handle.as_bytes());
            }
            Response::Data { id, data } => {
                dst.put_u8(SSH_FXP_DATA);
                dst.put_u32(*id);
                put_string(&mut dst, data);
            }
            Response::Name { id, entries } => {
                dst.put_u8(SSH_FXP_NAME);
                dst.put_u32(*id);
                dst.put_u32(entries.len() as u32);
                for entry in entries {
                    put_string(&mut dst, entry.filename.as_bytes());
                    put_string(&mut dst, entry.long_name.as_bytes());
                    entry.attrs.encode(&mut dst);
                }
            }
            Response::Attrs { id, attrs } => {
                dst.put_u8(SSH_FXP_ATTRS);
                dst.put_u32(*id);
                attrs.encode(&mut dst);
            }
        }
        dst.freeze()
    }
}
