//! Exec request parsing and dispatch
//!
//! An exec payload is tokenized into a command name and arguments, then
//! classified once into an [`SshCommandKind`]. Handlers for each kind live
//! in the sibling modules as `impl SshCommand` blocks.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::channel::CommandChannel;
use super::hash::HashAlgorithm;
use super::system::SystemCommand;
use crate::connection::{ActiveConnections, Connection};
use crate::error::{Result, SftpdError};
use crate::scp::ScpCommand;
use crate::vfs::path_utils::clean_command_path;

/// Every exec command the server knows how to run
pub const SUPPORTED_COMMANDS: &[&str] = &[
    "scp",
    "md5sum",
    "sha1sum",
    "sha256sum",
    "sha384sum",
    "sha512sum",
    "cd",
    "pwd",
    "git-receive-pack",
    "git-upload-pack",
    "git-upload-archive",
    "rsync",
    "sftpgo-copy",
    "sftpgo-remove",
];

/// What an exec command resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshCommandKind {
    Scp,
    Hash(HashAlgorithm),
    System(SystemCommand),
    Cd,
    Pwd,
    Copy,
    Remove,
}

impl SshCommandKind {
    /// Classify a command name, `None` when it is unknown or not in the
    /// `enabled` list.
    pub fn classify(name: &str, enabled: &[String]) -> Option<Self> {
        if !enabled.iter().any(|c| c == name) {
            return None;
        }
        let kind = match name {
            "scp" => SshCommandKind::Scp,
            "cd" => SshCommandKind::Cd,
            "pwd" => SshCommandKind::Pwd,
            "sftpgo-copy" => SshCommandKind::Copy,
            "sftpgo-remove" => SshCommandKind::Remove,
            other => {
                if let Some(algorithm) = HashAlgorithm::from_command(other) {
                    SshCommandKind::Hash(algorithm)
                } else {
                    SshCommandKind::System(SystemCommand::from_command(other)?)
                }
            }
        };
        Some(kind)
    }
}

/// Split an exec payload into the command name and its arguments.
///
/// Words are separated by whitespace; backslash escapes the next character
/// and single or double quotes group words, as a POSIX shell would.
pub fn parse_command_payload(payload: &str) -> Result<(String, Vec<String>)> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = payload.chars();

    let unterminated = || SftpdError::Syntax(format!("unable to parse command payload {:?}", payload));

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(_) => match c {
                '"' => quote = None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => return Err(unterminated()),
                },
                _ => current.push(c),
            },
            None => match c {
                '\\' => {
                    current.push(chars.next().ok_or_else(unterminated)?);
                    in_word = true;
                }
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(unterminated());
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(SftpdError::Syntax("empty command".to_string()));
    }
    let name = words.remove(0);
    Ok((name, words))
}

/// Virtual path targeted by a command: its last argument, cleaned.
/// Empty when there are no arguments.
pub fn get_dest_path(args: &[String]) -> String {
    match args.last() {
        Some(last) => clean_command_path(last),
        None => String::new(),
    }
}

/// A classified exec request bound to its connection
pub struct SshCommand {
    pub kind: SshCommandKind,
    pub command: String,
    pub args: Vec<String>,
    pub connection: Arc<Connection>,
}

impl fmt::Debug for SshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCommand")
            .field("kind", &self.kind)
            .field("args", &self.args)
            .field("connection_id", &self.connection.id())
            .finish()
    }
}

impl fmt::Display for SshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.command)
        } else {
            write!(f, "{} {}", self.command, self.args.join(" "))
        }
    }
}

impl SshCommand {
    /// Parse and classify an exec payload.
    ///
    /// Fails with `OpUnsupported` for commands that are unknown or not
    /// enabled, the caller then rejects the exec request.
    pub fn parse(connection: Arc<Connection>, payload: &str, enabled: &[String]) -> Result<Self> {
        let (command, args) = parse_command_payload(payload)?;
        let kind = match SshCommandKind::classify(&command, enabled) {
            Some(kind) => kind,
            None => {
                debug!(connection_id = %connection.id(), "unsupported exec command {:?}", command);
                return Err(SftpdError::OpUnsupported);
            }
        };
        Ok(Self {
            kind,
            command,
            args,
            connection,
        })
    }

    pub fn get_dest_path(&self) -> String {
        get_dest_path(&self.args)
    }

    /// Run the command on `channel` while the connection is listed as
    /// active.
    ///
    /// A panic inside a handler is contained here and reported to this
    /// session as a generic failure.
    pub async fn handle(&self, channel: &mut dyn CommandChannel, connections: &ActiveConnections) -> Result<()> {
        let _guard = connections.track(self.connection.clone());
        self.connection.set_command(self.to_string());
        self.connection.update_last_activity();
        info!(
            connection_id = %self.connection.id(),
            username = %self.connection.username(),
            "handling ssh command {:?}, args: {:?}",
            self.command,
            self.args
        );

        match AssertUnwindSafe(self.dispatch(&mut *channel)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    connection_id = %self.connection.id(),
                    "panic while handling ssh command {:?}",
                    self.command
                );
                let err = SftpdError::GenericFailure;
                if self.kind != SshCommandKind::Scp {
                    self.send_error_response(channel, &err).await;
                } else if let Err(e) = channel.send_exit_status(1).await {
                    debug!(connection_id = %self.connection.id(), "unable to send exit status: {}", e);
                }
                Err(err)
            }
        }
    }

    async fn dispatch(&self, channel: &mut dyn CommandChannel) -> Result<()> {
        let result = match self.kind {
            SshCommandKind::Scp => {
                return ScpCommand::new(self.connection.clone(), self.args.clone(), channel)
                    .handle()
                    .await;
            }
            SshCommandKind::Cd => Ok(()),
            SshCommandKind::Pwd => channel.write_all(b"/\n").await.map_err(SftpdError::from),
            SshCommandKind::Hash(algorithm) => self.handle_hash_command(algorithm, channel).await,
            SshCommandKind::System(command) => return self.execute_system_command(command, channel).await,
            SshCommandKind::Copy => self.handle_copy().await,
            SshCommandKind::Remove => self.handle_remove().await,
        };
        let result = match result {
            Ok(()) if matches!(self.kind, SshCommandKind::Copy | SshCommandKind::Remove) => {
                channel.write_all(b"OK\n").await.map_err(SftpdError::from)
            }
            other => other,
        };
        self.finish(channel, result).await
    }

    /// Send the error line or the success exit status.
    pub(crate) async fn finish(&self, channel: &mut dyn CommandChannel, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => {
                if let Err(e) = channel.flush().await {
                    debug!(connection_id = %self.connection.id(), "unable to flush channel: {}", e);
                }
                if let Err(e) = channel.send_exit_status(0).await {
                    debug!(connection_id = %self.connection.id(), "unable to send exit status: {}", e);
                }
            }
            Err(err) => self.send_error_response(channel, err).await,
        }
        result
    }

    pub(crate) async fn send_error_response(&self, channel: &mut dyn CommandChannel, err: &SftpdError) {
        warn!(
            connection_id = %self.connection.id(),
            username = %self.connection.username(),
            "command {:?} failed, args: {:?}, error: {}",
            self.command,
            self.args,
            err
        );
        let msg = format!("{}: {} {}\n", self.command, self.get_dest_path(), err);
        if let Err(e) = channel.write_all(msg.as_bytes()).await {
            debug!(connection_id = %self.connection.id(), "unable to send error response: {}", e);
        }
        let _ = channel.flush().await;
        if let Err(e) = channel.send_exit_status(1).await {
            debug!(connection_id = %self.connection.id(), "unable to send exit status: {}", e);
        }
    }

    /// Number of regular files and their total size at `path`.
    ///
    /// A missing path and a symlink both count as nothing.
    pub fn get_size_for_path(&self, path: &Path) -> Result<(u64, u64)> {
        let fs = self.connection.fs();
        let info = match fs.lstat(path) {
            Ok(info) => info,
            Err(e) if e.is_not_exist() => return Ok((0, 0)),
            Err(e) => {
                warn!(connection_id = %self.connection.id(), "unable to stat {:?}: {}", path, e);
                return Err(e);
            }
        };
        if info.is_dir {
            return fs.get_dir_size(path);
        }
        if info.is_regular() {
            return Ok((1, info.size));
        }
        Ok((0, 0))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::tests::{test_connection, test_user};
    use crate::connection::Protocol;
    use crate::dataprovider::QuotaStore;
    use crate::ssh::channel::MockChannel;
    use crate::vfs::mock::MockFs;
    use crate::vfs::OsFs;
    use tempfile::tempdir;

    pub(crate) fn all_enabled() -> Vec<String> {
        SUPPORTED_COMMANDS.iter().map(|c| c.to_string()).collect()
    }

    pub(crate) fn command(conn: &Arc<Connection>, payload: &str) -> SshCommand {
        SshCommand::parse(conn.clone(), payload, &all_enabled()).unwrap()
    }

    #[test]
    fn test_parse_command_payload() {
        let (name, args) = parse_command_payload(r"command -a  -f  /ab\ à/some\ spaces\ \ \(\).txt").unwrap();
        assert_eq!(name, "command");
        assert_eq!(args.len(), 3);
        assert_eq!(args[2], "/ab à/some spaces  ().txt");

        let (name, args) = parse_command_payload(r#"md5sum "/a file" 'b c' d\"e"#).unwrap();
        assert_eq!(name, "md5sum");
        assert_eq!(args, vec!["/a file", "b c", "d\"e"]);

        assert!(parse_command_payload("").is_err());
        assert!(parse_command_payload("   ").is_err());
        assert!(parse_command_payload("md5sum 'unterminated").is_err());
        assert!(parse_command_payload("md5sum trailing\\").is_err());
    }

    #[test]
    fn test_get_dest_path() {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(get_dest_path(&args(&["-t", "/tmp/../path"])), "/path");
        assert_eq!(get_dest_path(&args(&["-t", ".."])), "/");
        assert_eq!(get_dest_path(&args(&["-t", "."])), "/");
        assert_eq!(get_dest_path(&args(&["-t", "//"])), "/");
        assert_eq!(get_dest_path(&args(&["-t", "../.."])), "/");
        assert_eq!(get_dest_path(&args(&["-t", "tmp/"])), "/tmp/");
        assert_eq!(get_dest_path(&args(&["-f", "'/my file.txt'"])), "/my file.txt");
        assert_eq!(get_dest_path(&args(&["-t", "/with space"])), "/with space");
        assert_eq!(get_dest_path(&[]), "");
    }

    #[test]
    fn test_classify() {
        let enabled = all_enabled();
        assert_eq!(SshCommandKind::classify("scp", &enabled), Some(SshCommandKind::Scp));
        assert_eq!(
            SshCommandKind::classify("sha256sum", &enabled),
            Some(SshCommandKind::Hash(HashAlgorithm::Sha256))
        );
        assert_eq!(
            SshCommandKind::classify("rsync", &enabled),
            Some(SshCommandKind::System(SystemCommand::Rsync))
        );
        assert_eq!(SshCommandKind::classify("sftpgo-remove", &enabled), Some(SshCommandKind::Remove));
        assert_eq!(SshCommandKind::classify("ls", &enabled), None);

        let restricted = vec!["scp".to_string()];
        assert_eq!(SshCommandKind::classify("md5sum", &restricted), None);
        // enabled but not known
        assert_eq!(SshCommandKind::classify("ls", &["ls".to_string()]), None);
    }

    #[test]
    fn test_parse_rejects_unsupported() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        assert!(matches!(
            SshCommand::parse(conn.clone(), "ls -la", &all_enabled()),
            Err(SftpdError::OpUnsupported)
        ));
        let cmd = command(&conn, "md5sum /file");
        assert_eq!(cmd.to_string(), "md5sum /file");
        assert_eq!(cmd.get_dest_path(), "/file");
    }

    #[tokio::test]
    async fn test_cd_and_pwd() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let connections = ActiveConnections::new();

        let mut channel = MockChannel::new(Vec::new());
        command(&conn, "cd /tmp").handle(&mut channel, &connections).await.unwrap();
        assert_eq!(channel.exit_status, Some(0));
        assert!(channel.output().is_empty());

        let mut channel = MockChannel::new(Vec::new());
        command(&conn, "pwd").handle(&mut channel, &connections).await.unwrap();
        assert_eq!(channel.output_string(), "/\n");
        assert_eq!(channel.exit_status, Some(0));
        assert!(connections.is_empty());
        assert_eq!(conn.command(), "pwd");
    }

    #[tokio::test]
    async fn test_error_response_format() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let mut channel = MockChannel::new(Vec::new());
        let cmd = command(&conn, "md5sum /missing.dat");
        assert!(cmd.handle(&mut channel, &ActiveConnections::new()).await.is_err());
        assert!(channel.output_string().starts_with("md5sum: /missing.dat "));
        assert_eq!(channel.exit_status, Some(1));
    }

    #[tokio::test]
    async fn test_scp_goes_through_engine() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Scp);
        let mut channel = MockChannel::new(b"E\n".to_vec());
        let err = command(&conn, "scp -t /").handle(&mut channel, &ActiveConnections::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "unacceptable end dir command");
        assert_eq!(channel.exit_status, Some(1));
    }

    #[test]
    fn test_get_size_for_path() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let cmd = command(&conn, "sftpgo-remove /dir");

        assert_eq!(cmd.get_size_for_path(&home.path().join("missing")).unwrap(), (0, 0));

        std::fs::create_dir(home.path().join("dir")).unwrap();
        std::fs::write(home.path().join("dir/a"), b"12345").unwrap();
        std::fs::write(home.path().join("dir/b"), b"123").unwrap();
        std::os::unix::fs::symlink(home.path().join("dir/a"), home.path().join("dir/link")).unwrap();
        assert_eq!(cmd.get_size_for_path(&home.path().join("dir")).unwrap(), (2, 8));
        assert_eq!(cmd.get_size_for_path(&home.path().join("dir/a")).unwrap(), (1, 5));
        assert_eq!(cmd.get_size_for_path(&home.path().join("dir/link")).unwrap(), (0, 0));
    }

    #[test]
    fn test_get_size_for_path_permission_error() {
        let home = tempdir().unwrap();
        std::fs::create_dir(home.path().join("dir")).unwrap();
        std::fs::write(home.path().join("dir/a"), b"12345").unwrap();
        let fs = Arc::new(MockFs::new(OsFs::new("conn_id", home.path().to_path_buf(), vec![])));
        let conn = Arc::new(Connection::new(
            "conn_id",
            Protocol::Ssh,
            test_user(home.path()),
            fs.clone(),
            Arc::new(QuotaStore::new()),
        ));
        let cmd = command(&conn, "sftpgo-remove /dir");

        *fs.walk_error.lock() = Some(SftpdError::io(std::io::ErrorKind::PermissionDenied, "walk denied"));
        let err = cmd.get_size_for_path(&home.path().join("dir")).unwrap_err();
        assert!(err.is_permission());
        assert_eq!(cmd.get_size_for_path(&home.path().join("dir/a")).unwrap(), (1, 5));

        *fs.lstat_error.lock() = Some(SftpdError::io(std::io::ErrorKind::PermissionDenied, "stat denied"));
        let err = cmd.get_size_for_path(&home.path().join("dir/a")).unwrap_err();
        assert!(err.is_permission());

        *fs.lstat_error.lock() = Some(SftpdError::io(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(cmd.get_size_for_path(&home.path().join("dir")).unwrap(), (0, 0));
    }
}
