//! External commands run against the user's home (`rsync`, `git-*`)
//!
//! The process gets the real path of the target in place of the virtual
//! one and its standard streams are pumped to and from the channel through
//! stream transfers, so bytes are accounted and stdin is capped by the
//! remaining quota.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::channel::CommandChannel;
use super::command::SshCommand;
use crate::dataprovider::Permission;
use crate::error::{Result, SftpdError};
use crate::transfer::{Transfer, TransferDirection, WriteLimit};

/// Permissions an external command needs on its target, it may read and
/// write anything below it
const SYSTEM_COMMAND_PERMISSIONS: &[Permission] = &[
    Permission::Download,
    Permission::ListItems,
    Permission::Overwrite,
    Permission::Upload,
    Permission::CreateDirs,
    Permission::Delete,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    Rsync,
    GitReceivePack,
    GitUploadPack,
    GitUploadArchive,
}

impl SystemCommand {
    pub fn from_command(name: &str) -> Option<Self> {
        match name {
            "rsync" => Some(SystemCommand::Rsync),
            "git-receive-pack" => Some(SystemCommand::GitReceivePack),
            "git-upload-pack" => Some(SystemCommand::GitUploadPack),
            "git-upload-archive" => Some(SystemCommand::GitUploadArchive),
            _ => None,
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            SystemCommand::Rsync => "rsync",
            SystemCommand::GitReceivePack => "git-receive-pack",
            SystemCommand::GitUploadPack => "git-upload-pack",
            SystemCommand::GitUploadArchive => "git-upload-archive",
        }
    }
}

/// Process invocation for an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: &'static str,
    pub args: Vec<String>,
    /// Real path of the target, `None` without arguments
    pub fs_path: Option<PathBuf>,
}

impl SshCommand {
    /// Build the process invocation, rewriting the target to its real path.
    ///
    /// rsync gets `--safe-links` when the user may create symlinks and
    /// `--munge-links` otherwise, unless already present.
    pub fn get_system_command(&self, command: SystemCommand) -> Result<ProcessSpec> {
        let mut args = self.args.clone();
        let mut fs_path = None;
        if !args.is_empty() {
            let real = self.connection.fs().resolve_path(&self.get_dest_path())?;
            args.pop();
            args.push(real.to_string_lossy().into_owned());
            fs_path = Some(real);
        }
        self.is_system_command_allowed()?;

        if command == SystemCommand::Rsync {
            let user = self.connection.user();
            let flag = if user.has_perm(Permission::CreateSymlinks, &self.get_dest_path()) {
                "--safe-links"
            } else {
                "--munge-links"
            };
            if !args.iter().any(|a| a == flag) {
                args.insert(0, flag.to_string());
            }
        }
        debug!(
            connection_id = %self.connection.id(),
            "new system command {:?}, with args: {:?} fs path: {:?}",
            command.program(),
            args,
            fs_path
        );
        Ok(ProcessSpec {
            program: command.program(),
            args,
            fs_path,
        })
    }

    /// A single process cannot honor virtual folders mapped below its
    /// target nor extension filters.
    fn is_system_command_allowed(&self) -> Result<()> {
        let dest = self.get_dest_path();
        let user = self.connection.user();
        if user.has_virtual_folders_inside(&dest) {
            info!(
                connection_id = %self.connection.id(),
                "command {:?} is not allowed, path {:?} has virtual folders inside it",
                self.command,
                dest
            );
            return Err(SftpdError::UnsupportedConfig);
        }
        if user.has_filters_overlapping(&dest) {
            info!(
                connection_id = %self.connection.id(),
                "command {:?} is not allowed, path {:?} overlaps extension filters",
                self.command,
                dest
            );
            return Err(SftpdError::UnsupportedConfig);
        }
        Ok(())
    }

    /// Run the process and report its exit status, or the error line with
    /// exit status 1 when it cannot start.
    pub(crate) async fn execute_system_command(
        &self,
        command: SystemCommand,
        channel: &mut dyn CommandChannel,
    ) -> Result<()> {
        match self.run_system_command(command, channel).await {
            Ok(status) => {
                if let Err(e) = channel.send_exit_status(status).await {
                    debug!(connection_id = %self.connection.id(), "unable to send exit status: {}", e);
                }
                Ok(())
            }
            Err(err) => {
                self.send_error_response(channel, &err).await;
                Err(err)
            }
        }
    }

    fn stream_transfer(&self, direction: TransferDirection, spec: &ProcessSpec, limit: WriteLimit) -> Transfer {
        let fs_path = spec.fs_path.clone().unwrap_or_default();
        Transfer::builder(self.connection.clone(), direction, fs_path, self.get_dest_path())
            .max_write_size(limit)
            .build()
    }

    async fn run_system_command(&self, command: SystemCommand, channel: &mut dyn CommandChannel) -> Result<u32> {
        let spec = self.get_system_command(command)?;
        if !self.connection.fs().is_local() {
            return Err(SftpdError::UnsupportedConfig);
        }
        let quota = self.connection.has_space(true);
        if !quota.has_space {
            return Err(SftpdError::QuotaExceeded);
        }
        let dest = self.get_dest_path();
        if !self.connection.user().has_perms(SYSTEM_COMMAND_PERMISSIONS, &dest) {
            return Err(SftpdError::PermissionDenied);
        }

        let (initial_files, initial_size) = match &spec.fs_path {
            Some(path) => self.get_size_for_path(path)?,
            None => (0, 0),
        };

        let mut child = Command::new(spec.program)
            .args(&spec.args)
            .current_dir(&self.connection.user().home_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            connection_id = %self.connection.id(),
            username = %self.connection.username(),
            "started {:?}, args: {:?}",
            spec.program,
            spec.args
        );

        let missing = || SftpdError::io(std::io::ErrorKind::BrokenPipe, "process stdio not captured");
        let child_stdin = child.stdin.take().ok_or_else(missing)?;
        let mut child_stdout = child.stdout.take().ok_or_else(missing)?;
        let mut child_stderr = child.stderr.take().ok_or_else(missing)?;

        let stdin_transfer = self.stream_transfer(
            TransferDirection::Upload,
            &spec,
            WriteLimit::from_size(quota.get_remaining_size()),
        );
        let stdout_transfer = self.stream_transfer(TransferDirection::Download, &spec, WriteLimit::Unlimited);
        let stderr_transfer = self.stream_transfer(TransferDirection::Download, &spec, WriteLimit::Unlimited);

        let mut stderr_writer = channel.take_stderr();
        {
            let (mut channel_reader, mut channel_writer) = tokio::io::split(&mut *channel);

            let stdin_pump = {
                let mut child_stdin = child_stdin;
                let reader = &mut channel_reader;
                let transfer = &stdin_transfer;
                async move {
                    let result = transfer.copy_from_reader_to_writer(&mut child_stdin, reader).await;
                    // EOF for the process
                    drop(child_stdin);
                    result
                }
            };
            let stdout_pump = stdout_transfer.copy_from_reader_to_writer(&mut channel_writer, &mut child_stdout);
            let stderr_pump = async {
                match stderr_writer.as_mut() {
                    Some(writer) => stderr_transfer.copy_from_reader_to_writer(writer, &mut child_stderr).await,
                    None => {
                        stderr_transfer
                            .copy_from_reader_to_writer(&mut tokio::io::sink(), &mut child_stderr)
                            .await
                    }
                }
            };
            let output = async { tokio::join!(stdout_pump, stderr_pump) };
            tokio::pin!(stdin_pump);
            tokio::pin!(output);

            let mut stdin_done = false;
            let (stdout_result, _) = loop {
                tokio::select! {
                    result = &mut stdin_pump, if !stdin_done => {
                        stdin_done = true;
                        if let Err(e) = result {
                            debug!(connection_id = %self.connection.id(), "stdin copy error: {}, killing process", e);
                            let _ = child.start_kill();
                        }
                    }
                    results = &mut output => break results,
                }
            };
            if let Err(e) = stdout_result {
                debug!(connection_id = %self.connection.id(), "stdout copy error: {}, killing process", e);
                let _ = child.start_kill();
            }
        }

        let status = child.wait().await?;
        for transfer in [&stdin_transfer, &stdout_transfer, &stderr_transfer] {
            if let Err(e) = transfer.close() {
                debug!(connection_id = %self.connection.id(), "stream transfer closed with error: {}", e);
            }
        }
        info!(
            connection_id = %self.connection.id(),
            "command {:?} finished, {}, bytes in: {} out: {}",
            self.command,
            status,
            stdin_transfer.bytes_received(),
            stdout_transfer.bytes_sent()
        );

        if let Some(path) = &spec.fs_path {
            match self.get_size_for_path(path) {
                Ok((files, size)) => self.connection.update_quota(
                    files as i64 - initial_files as i64,
                    size as i64 - initial_size as i64,
                ),
                Err(e) => warn!(connection_id = %self.connection.id(), "unable to update quota after {:?}: {}", self.command, e),
            }
        }
        Ok(status.code().map(|c| c as u32).unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{test_connection, test_user};
    use crate::connection::{ActiveConnections, Connection, Protocol};
    use crate::dataprovider::{ExtensionsFilter, QuotaStore, User};
    use crate::ssh::channel::MockChannel;
    use crate::ssh::command::tests::command;
    use crate::vfs::mock::MockFs;
    use crate::vfs::{OsFs, VirtualFolder};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn home_arg(home: &std::path::Path) -> String {
        home.to_string_lossy().into_owned()
    }

    #[test]
    fn test_rsync_link_flags() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let spec = command(&conn, "rsync --server -vlogDtprze.iLsfxC . /")
            .get_system_command(SystemCommand::Rsync)
            .unwrap();
        assert_eq!(spec.program, "rsync");
        assert_eq!(
            spec.args,
            vec!["--safe-links", "--server", "-vlogDtprze.iLsfxC", ".", &home_arg(home.path())]
        );

        let spec = command(&conn, "rsync --safe-links --server . /")
            .get_system_command(SystemCommand::Rsync)
            .unwrap();
        assert_eq!(spec.args.iter().filter(|a| *a == "--safe-links").count(), 1);

        let mut user = test_user(home.path());
        user.permissions.insert(
            "/".to_string(),
            vec![Permission::ListItems, Permission::Download, Permission::Upload],
        );
        let conn = test_connection(user, Protocol::Ssh);
        let spec = command(&conn, "rsync --server . /")
            .get_system_command(SystemCommand::Rsync)
            .unwrap();
        assert_eq!(spec.args[0], "--munge-links");
    }

    #[test]
    fn test_git_target_rewritten() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let spec = command(&conn, "git-upload-pack '/repo.git'")
            .get_system_command(SystemCommand::GitUploadPack)
            .unwrap();
        assert_eq!(spec.args, vec![home_arg(&home.path().join("repo.git"))]);
        assert_eq!(spec.fs_path, Some(home.path().join("repo.git")));

        let spec = command(&conn, "git-upload-pack")
            .get_system_command(SystemCommand::GitUploadPack)
            .unwrap();
        assert!(spec.args.is_empty());
        assert!(spec.fs_path.is_none());
    }

    #[test]
    fn test_extension_filters_overlapping() {
        let home = tempdir().unwrap();
        let mut user = test_user(home.path());
        user.filters.file_extensions = vec![ExtensionsFilter {
            path: "/subdir".to_string(),
            allowed_extensions: vec![".jpg".to_string()],
            denied_extensions: vec![],
        }];
        let conn = test_connection(user, Protocol::Ssh);
        let check = |payload: &str, kind: SystemCommand| command(&conn, payload).get_system_command(kind);

        assert!(matches!(check("rsync --server . /", SystemCommand::Rsync), Err(SftpdError::UnsupportedConfig)));
        assert!(matches!(check("git-receive-pack /subdir", SystemCommand::GitReceivePack), Err(SftpdError::UnsupportedConfig)));
        assert!(matches!(check("git-receive-pack /subdir/dir", SystemCommand::GitReceivePack), Err(SftpdError::UnsupportedConfig)));
        assert!(check("git-receive-pack /adir/subdir", SystemCommand::GitReceivePack).is_ok());
    }

    #[test]
    fn test_virtual_folders_inside_target() {
        let home = tempdir().unwrap();
        let mapped = tempdir().unwrap();
        let mut user: User = test_user(home.path());
        user.virtual_folders = vec![VirtualFolder {
            virtual_path: "/vdir".to_string(),
            mapped_path: mapped.path().to_path_buf(),
        }];
        let conn = test_connection(user, Protocol::Ssh);
        let check = |payload: &str| command(&conn, payload).get_system_command(SystemCommand::GitUploadPack);

        let spec = check("git-upload-pack /vdir").unwrap();
        assert_eq!(spec.fs_path, Some(mapped.path().to_path_buf()));
        assert!(matches!(check("git-upload-pack /"), Err(SftpdError::UnsupportedConfig)));
        assert!(check("git-upload-pack /vdir1").is_ok());
        assert_eq!(
            check("git-upload-pack /vdir/subdir").unwrap().fs_path,
            Some(mapped.path().join("subdir"))
        );
        let rsync = command(&conn, "rsync --server . /").get_system_command(SystemCommand::Rsync);
        assert!(matches!(rsync, Err(SftpdError::UnsupportedConfig)));
    }

    #[tokio::test]
    async fn test_execute_checks_before_start() {
        let home = tempdir().unwrap();
        let connections = ActiveConnections::new();

        let mut user = test_user(home.path());
        user.quota_files = 1;
        user.used_quota_files = 2;
        let conn = test_connection(user, Protocol::Ssh);
        let mut channel = MockChannel::new(Vec::new());
        let err = command(&conn, "git-receive-pack /repo.git")
            .handle(&mut channel, &connections)
            .await
            .unwrap_err();
        assert!(matches!(err, SftpdError::QuotaExceeded));
        assert!(channel.output_string().starts_with("git-receive-pack: /repo.git "));
        assert_eq!(channel.exit_status, Some(1));

        let mut user = test_user(home.path());
        user.permissions.insert("/".to_string(), vec![Permission::ListItems]);
        let conn = test_connection(user, Protocol::Ssh);
        let mut channel = MockChannel::new(Vec::new());
        let err = command(&conn, "git-upload-pack /repo.git")
            .handle(&mut channel, &connections)
            .await
            .unwrap_err();
        assert!(matches!(err, SftpdError::PermissionDenied));

        let user = test_user(home.path());
        let fs = Arc::new(MockFs::remote(OsFs::new("remote", home.path().to_path_buf(), vec![])));
        let conn = Arc::new(Connection::new("remote", Protocol::Ssh, user, fs, Arc::new(QuotaStore::new())));
        let mut channel = MockChannel::new(Vec::new());
        let err = command(&conn, "rsync --server . /")
            .handle(&mut channel, &connections)
            .await
            .unwrap_err();
        assert!(matches!(err, SftpdError::UnsupportedConfig));
        assert_eq!(conn.active_transfers_count(), 0);
    }
}
