//! SCP command engine
//!
//! Drives the sink (`-t`, upload) and source (`-f`, download) sides of the
//! SCP protocol over an exec channel. Every step is acknowledged with a
//! single confirmation byte; an error aborts the whole command and is sent
//! back to the client as a fatal confirmation message.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::message::{file_mode_string, ScpMessage, MAX_LINE_LENGTH, SCP_ERROR, SCP_OK, SCP_WARNING};
use crate::connection::Connection;
use crate::dataprovider::Permission;
use crate::error::{Result, SftpdError};
use crate::ssh::channel::CommandChannel;
use crate::ssh::command::get_dest_path;
use crate::transfer::{Transfer, TransferDirection, COPY_BUFFER_SIZE};
use crate::vfs::path_utils::{base_name, clean_path, join_virtual_path, parent_dir};
use crate::vfs::{CreateFlags, FileInfo};

/// Directory being sent during a recursive download
struct DirFrame {
    pending: VecDeque<String>,
}

pub struct ScpCommand<'a> {
    connection: Arc<Connection>,
    args: Vec<String>,
    channel: &'a mut dyn CommandChannel,
}

impl<'a> ScpCommand<'a> {
    pub fn new(connection: Arc<Connection>, args: Vec<String>, channel: &'a mut dyn CommandChannel) -> Self {
        Self {
            connection,
            args,
            channel,
        }
    }

    /// Single dash options before the path argument
    fn has_flag(&self, flag: char) -> bool {
        let options = self.args.len().saturating_sub(1);
        self.args[..options]
            .iter()
            .any(|arg| arg.starts_with('-') && !arg.starts_with("--") && arg.contains(flag))
    }

    fn is_recursive(&self) -> bool {
        self.has_flag('r')
    }

    fn send_file_time(&self) -> bool {
        self.has_flag('p')
    }

    /// Run the command, reporting any error to the client and sending the
    /// exit status.
    pub async fn handle(&mut self) -> Result<()> {
        let dest = get_dest_path(&self.args);
        let result = if self.has_flag('t') {
            self.handle_upload_command(&dest).await
        } else if self.has_flag('f') {
            self.handle_download_command(&dest).await
        } else {
            debug!(connection_id = %self.connection.id(), "unsupported scp command, args: {:?}", self.args);
            Err(SftpdError::Syntax(format!("scp command not supported, args: {:?}", self.args)))
        };

        if let Err(err) = &result {
            warn!(
                connection_id = %self.connection.id(),
                username = %self.connection.username(),
                "scp command failed, args: {:?}, error: {}",
                self.args,
                err
            );
            if let Err(e) = self.send_error_message(err).await {
                debug!(connection_id = %self.connection.id(), "unable to send scp error message: {}", e);
            }
        }
        let status = if result.is_ok() { 0 } else { 1 };
        if let Err(e) = self.channel.send_exit_status(status).await {
            debug!(connection_id = %self.connection.id(), "unable to send exit status: {}", e);
        }
        result
    }

    async fn handle_upload_command(&mut self, dest: &str) -> Result<()> {
        self.send_confirmation().await?;
        self.handle_recursive_upload(dest).await
    }

    async fn handle_download_command(&mut self, dest: &str) -> Result<()> {
        self.read_confirmation().await?;
        self.handle_download(dest).await
    }

    /// Receive files and directories until the client closes its side.
    async fn handle_recursive_upload(&mut self, dest: &str) -> Result<()> {
        let mut frames: Vec<String> = Vec::new();
        loop {
            let msg = match self.next_upload_message().await? {
                Some(msg) => msg,
                None => return Ok(()),
            };
            match msg {
                ScpMessage::EndDir => {
                    if frames.pop().is_none() {
                        return Err(SftpdError::Syntax("unacceptable end dir command".to_string()));
                    }
                }
                ScpMessage::Dir { name, .. } => {
                    if !self.is_recursive() {
                        return Err(SftpdError::Syntax(
                            "unable to receive a directory for a non recursive copy".to_string(),
                        ));
                    }
                    let path = self.upload_target(frames.last(), dest, &name);
                    self.handle_create_dir(&path)?;
                    frames.push(path);
                }
                ScpMessage::File { size, name, .. } => {
                    let path = self.upload_target(frames.last(), dest, &name);
                    self.handle_upload(&path, size).await?;
                }
                ScpMessage::Time { .. } => {}
            }
            self.send_confirmation().await?;
        }
    }

    /// Virtual path for an entry received inside `current`, or at the top
    /// level when no directory is open.
    ///
    /// At the top level the destination itself is the target unless it is
    /// an existing directory or ends with `/`, as with
    /// `scp file host:/new_name`.
    fn upload_target(&self, current: Option<&String>, dest: &str, name: &str) -> String {
        if let Some(dir) = current {
            return join_virtual_path(dir, name);
        }
        if dest.ends_with('/') {
            return join_virtual_path(dest, name);
        }
        let fs = self.connection.fs();
        let is_dir = fs
            .resolve_path(dest)
            .and_then(|p| fs.stat(&p))
            .map(|info| info.is_dir)
            .unwrap_or(false);
        if is_dir {
            join_virtual_path(dest, name)
        } else {
            clean_path(dest)
        }
    }

    fn handle_create_dir(&self, virtual_path: &str) -> Result<()> {
        self.connection.update_last_activity();
        let user = self.connection.user();
        let fs = self.connection.fs();
        let real = fs.resolve_path(virtual_path)?;
        if user.is_virtual_folder(virtual_path) {
            debug!(connection_id = %self.connection.id(), "directory {:?} is a virtual folder", virtual_path);
            return Ok(());
        }
        if !user.has_perm(Permission::CreateDirs, &parent_dir(virtual_path)) {
            warn!(connection_id = %self.connection.id(), "create dir {:?} denied", virtual_path);
            return Err(SftpdError::PermissionDenied);
        }
        match fs.stat(&real) {
            Ok(info) if info.is_dir => Ok(()),
            _ => {
                fs.mkdir(&real)?;
                debug!(connection_id = %self.connection.id(), "created dir {:?}", real);
                Ok(())
            }
        }
    }

    async fn handle_upload(&mut self, virtual_path: &str, size: u64) -> Result<()> {
        self.connection.update_last_activity();
        let user = self.connection.user();
        let fs = self.connection.fs();
        if !user.is_file_allowed(virtual_path) {
            warn!(connection_id = %self.connection.id(), "writing file {:?} is not allowed", virtual_path);
            return Err(SftpdError::PermissionDenied);
        }
        let real = fs.resolve_path(virtual_path)?;

        let (is_new_file, file_size) = match fs.lstat(&real) {
            Ok(info) if info.is_symlink => (true, 0),
            Ok(info) if info.is_dir => {
                return Err(SftpdError::Path(format!(
                    "attempted to open a directory for writing: {:?}",
                    virtual_path
                )));
            }
            Ok(info) => (false, info.size),
            Err(e) if e.is_not_exist() => (true, 0),
            Err(e) => {
                warn!(connection_id = %self.connection.id(), "error performing file stat {:?}: {}", real, e);
                return Err(e);
            }
        };
        let required = if is_new_file {
            (Permission::Upload, parent_dir(virtual_path))
        } else {
            (Permission::Overwrite, clean_path(virtual_path))
        };
        if !user.has_perm(required.0, &required.1) {
            return Err(SftpdError::PermissionDenied);
        }

        let quota = self.connection.has_space(is_new_file);
        if !quota.has_space {
            info!(connection_id = %self.connection.id(), "denying file write due to quota limits");
            return Err(SftpdError::QuotaExceeded);
        }
        let max_write_size = self.connection.get_max_write_size(&quota, false, file_size as i64)?;

        let file_path = if self.connection.is_atomic_upload_enabled() {
            fs.get_atomic_upload_path(&real)
        } else {
            real.clone()
        };
        let opened = fs.create(&file_path, CreateFlags::default())?;
        let transfer = Transfer::builder(self.connection.clone(), TransferDirection::Upload, &real, virtual_path)
            .file_path(&file_path)
            .opened(opened)
            .new_file(is_new_file)
            .initial_size(file_size as i64)
            .max_write_size(max_write_size)
            .expected_size(size)
            .build();
        self.get_upload_file_data(size, &transfer).await
    }

    async fn get_upload_file_data(&mut self, size: u64, transfer: &Transfer) -> Result<()> {
        if let Err(err) = self.send_confirmation().await {
            return fail_transfer(transfer, err);
        }

        let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(size as usize)];
        let mut remaining = size;
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = match self.channel.read(&mut buf[..want]).await {
                Ok(0) => {
                    let err = SftpdError::io(io::ErrorKind::UnexpectedEof, "unexpected EOF while receiving file data");
                    return fail_transfer(transfer, err);
                }
                Ok(n) => n,
                Err(e) => return fail_transfer(transfer, e.into()),
            };
            if let Err(err) = transfer.write_at(&buf[..n], size - remaining) {
                let _ = transfer.close();
                return Err(err);
            }
            remaining -= n as u64;
        }

        if let Err(err) = self.read_confirmation().await {
            return fail_transfer(transfer, err);
        }
        transfer.close()
    }

    /// Send `virtual_path`, walking directories depth first with an
    /// explicit frame stack.
    async fn handle_download(&mut self, virtual_path: &str) -> Result<()> {
        let mut frames: Vec<DirFrame> = Vec::new();
        if let Some(frame) = self.download_entry(virtual_path).await? {
            frames.push(frame);
        }
        loop {
            let next = match frames.last_mut() {
                Some(frame) => frame.pending.pop_front(),
                None => return Ok(()),
            };
            match next {
                Some(child) => {
                    if let Some(frame) = self.download_entry(&child).await? {
                        frames.push(frame);
                    }
                }
                None => {
                    frames.pop();
                    self.send_protocol_message(&ScpMessage::EndDir).await?;
                    self.read_confirmation().await?;
                }
            }
        }
    }

    /// Send one file, or open one directory returning its frame.
    async fn download_entry(&mut self, virtual_path: &str) -> Result<Option<DirFrame>> {
        self.connection.update_last_activity();
        let connection = self.connection.clone();
        let user = connection.user();
        let fs = connection.fs();
        let real = fs.resolve_path(virtual_path)?;
        let info = fs.stat(&real)?;

        if info.is_dir {
            if !user.has_perm(Permission::Download, virtual_path) {
                return Err(SftpdError::PermissionDenied);
            }
            if !self.is_recursive() {
                return Err(SftpdError::Syntax(
                    "unable to send directory for non recursive copy".to_string(),
                ));
            }
            debug!(connection_id = %connection.id(), "recursive download, dir path: {:?}", virtual_path);
            self.send_download_protocol_messages(virtual_path, &info).await?;
            let pending = self.list_children(virtual_path, &real)?;
            return Ok(Some(DirFrame { pending }));
        }

        if !user.has_perm(Permission::Download, &parent_dir(virtual_path)) || !user.is_file_allowed(virtual_path) {
            return Err(SftpdError::PermissionDenied);
        }
        let opened = fs.open(&real)?;
        let transfer = Transfer::builder(connection.clone(), TransferDirection::Download, &real, virtual_path)
            .opened(opened)
            .build();
        match self.send_download_file_data(virtual_path, &info, &transfer).await {
            Ok(()) => transfer.close()?,
            Err(err) => {
                fail_transfer(&transfer, err)?;
            }
        }
        Ok(None)
    }

    /// Children of a directory: files sorted by name, then directories
    /// sorted by name, including virtual folders mapped directly inside.
    fn list_children(&self, virtual_path: &str, real: &Path) -> Result<VecDeque<String>> {
        let virtual_path = clean_path(virtual_path);
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in self.connection.fs().read_dir(real)? {
            let child = join_virtual_path(&virtual_path, &entry.name);
            if entry.is_dir {
                dirs.push(child);
            } else {
                files.push(child);
            }
        }
        for folder in &self.connection.user().virtual_folders {
            if folder.virtual_path != virtual_path
                && parent_dir(&folder.virtual_path) == virtual_path
                && !dirs.contains(&folder.virtual_path)
            {
                dirs.push(folder.virtual_path.clone());
            }
        }
        files.sort();
        dirs.sort();
        Ok(files.into_iter().chain(dirs).collect())
    }

    async fn send_time_message(&mut self, info: &FileInfo) -> Result<()> {
        let msg = ScpMessage::Time {
            mtime: unix_seconds(info.modified),
            atime: unix_seconds(info.accessed),
        };
        self.send_protocol_message(&msg).await?;
        self.read_confirmation().await
    }

    async fn send_download_protocol_messages(&mut self, virtual_path: &str, info: &FileInfo) -> Result<()> {
        if self.send_file_time() {
            self.send_time_message(info).await?;
        }
        let msg = ScpMessage::Dir {
            mode: file_mode_string(info.mode, true),
            name: base_name(virtual_path),
        };
        self.send_protocol_message(&msg).await?;
        self.read_confirmation().await
    }

    async fn send_download_file_data(&mut self, virtual_path: &str, info: &FileInfo, transfer: &Transfer) -> Result<()> {
        if self.send_file_time() {
            self.send_time_message(info).await?;
        }
        let msg = ScpMessage::File {
            mode: file_mode_string(info.mode, false),
            size: info.size,
            name: base_name(virtual_path),
        };
        self.send_protocol_message(&msg).await?;
        self.read_confirmation().await?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut offset = 0u64;
        loop {
            let n = transfer.read_at(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            self.channel.write_all(&buf[..n]).await?;
            offset += n as u64;
        }
        self.send_confirmation().await?;
        self.read_confirmation().await
    }

    /// Next control message, confirming and skipping `T` messages.
    /// `None` when the client closed its side.
    async fn next_upload_message(&mut self) -> Result<Option<ScpMessage>> {
        loop {
            let line = match self.read_protocol_message().await? {
                Some(line) => line,
                None => return Ok(None),
            };
            let msg = ScpMessage::parse(&line)?;
            if let ScpMessage::Time { .. } = msg {
                self.send_confirmation().await?;
                continue;
            }
            return Ok(Some(msg));
        }
    }

    /// Read one control line byte by byte, file data may follow it.
    async fn read_protocol_message(&mut self) -> Result<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.channel.read(&mut byte).await?;
            if n == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(SftpdError::io(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF reading protocol message",
                ));
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_LINE_LENGTH {
                return Err(SftpdError::Syntax("protocol message too long".to_string()));
            }
        }
        if let Some(&status) = line.first() {
            if status == SCP_WARNING || status == SCP_ERROR {
                return Err(SftpdError::Remote(String::from_utf8_lossy(&line[1..]).into_owned()));
            }
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| SftpdError::Syntax("protocol message is not valid UTF-8".to_string()))
    }

    async fn read_confirmation(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        let n = self.channel.read(&mut byte).await?;
        if n == 0 {
            return Err(SftpdError::io(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF waiting for confirmation",
            ));
        }
        match byte[0] {
            SCP_OK => Ok(()),
            status @ (SCP_WARNING | SCP_ERROR) => {
                let mut msg = Vec::new();
                loop {
                    match self.channel.read(&mut byte).await {
                        Ok(1) if byte[0] != b'\n' => msg.push(byte[0]),
                        _ => break,
                    }
                }
                let msg = String::from_utf8_lossy(&msg).into_owned();
                info!(
                    connection_id = %self.connection.id(),
                    "scp error message received: {:?}, is error: {}",
                    msg,
                    status == SCP_ERROR
                );
                Err(SftpdError::Remote(msg))
            }
            other => Err(SftpdError::Syntax(format!("unexpected confirmation byte {:#04x}", other))),
        }
    }

    async fn send_confirmation(&mut self) -> Result<()> {
        self.channel.write_all(&[SCP_OK]).await?;
        self.channel.flush().await?;
        Ok(())
    }

    async fn send_protocol_message(&mut self, msg: &ScpMessage) -> Result<()> {
        self.channel.write_all(format!("{}\n", msg).as_bytes()).await?;
        self.channel.flush().await?;
        Ok(())
    }

    async fn send_error_message(&mut self, err: &SftpdError) -> Result<()> {
        let mut msg = vec![SCP_ERROR];
        msg.extend_from_slice(err.to_string().as_bytes());
        msg.push(b'\n');
        self.channel.write_all(&msg).await?;
        self.channel.flush().await?;
        Ok(())
    }
}

/// Record `err` on the transfer, close it and return `err`.
fn fail_transfer(transfer: &Transfer, err: SftpdError) -> Result<()> {
    transfer.transfer_error(err.clone());
    let _ = transfer.close();
    Err(err)
}

fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
