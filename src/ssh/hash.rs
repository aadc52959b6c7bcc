//! Checksum commands (`md5sum`, `sha1sum`, `sha256sum`, ...)

use std::os::unix::fs::FileExt;
use std::path::Path;

use sha2::digest::DynDigest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::channel::CommandChannel;
use super::command::SshCommand;
use crate::dataprovider::Permission;
use crate::error::{Result, SftpdError};
use crate::transfer::COPY_BUFFER_SIZE;
use crate::vfs::{FileHandle, Fs};

/// Bytes of stdin hashed when no path is given
const STDIN_HASH_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_command(name: &str) -> Option<Self> {
        match name {
            "md5sum" => Some(HashAlgorithm::Md5),
            "sha1sum" => Some(HashAlgorithm::Sha1),
            "sha256sum" => Some(HashAlgorithm::Sha256),
            "sha384sum" => Some(HashAlgorithm::Sha384),
            "sha512sum" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    fn hasher(self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgorithm::Md5 => Box::new(md5::Md5::default()),
            HashAlgorithm::Sha1 => Box::new(sha1::Sha1::default()),
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    fn hash_bytes(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

/// Stream the file at `real_path` through the digest.
fn compute_hash_for_file(algorithm: HashAlgorithm, fs: &dyn Fs, real_path: &Path) -> Result<String> {
    let opened = fs.open(real_path)?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut offset = 0u64;
    loop {
        let n = match &opened.handle {
            FileHandle::File(file) => file.read_at(&mut buf, offset)?,
            FileHandle::Reader(reader) => reader.read_at(&mut buf, offset)?,
            FileHandle::Writer(_) => return Err(SftpdError::OpUnsupported),
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

impl SshCommand {
    /// Reply with `"<hex>  <path>\n"`, or `"<hex>  -\n"` for stdin.
    pub(crate) async fn handle_hash_command(
        &self,
        algorithm: HashAlgorithm,
        channel: &mut dyn CommandChannel,
    ) -> Result<()> {
        let response = if self.args.is_empty() {
            let mut buf = vec![0u8; STDIN_HASH_LIMIT];
            let mut filled = 0;
            while filled < buf.len() {
                let n = channel.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            format!("{}  -\n", algorithm.hash_bytes(&buf[..filled]))
        } else {
            let virtual_path = self.get_dest_path();
            let user = self.connection.user();
            if !user.is_file_allowed(&virtual_path) {
                warn!(connection_id = %self.connection.id(), "hash not allowed for file {:?}", virtual_path);
                return Err(SftpdError::PermissionDenied);
            }
            let fs = self.connection.fs().clone();
            let real_path = fs.resolve_path(&virtual_path)?;
            if !user.has_perm(Permission::ListItems, &virtual_path) {
                return Err(SftpdError::PermissionDenied);
            }
            let hash = tokio::task::spawn_blocking(move || compute_hash_for_file(algorithm, fs.as_ref(), &real_path))
                .await
                .map_err(|_| SftpdError::GenericFailure)??;
            debug!(connection_id = %self.connection.id(), "computed {:?} for {:?}", algorithm, virtual_path);
            format!("{}  {}\n", hash, virtual_path)
        };
        channel.write_all(response.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{test_connection, test_user};
    use crate::connection::{ActiveConnections, Protocol};
    use crate::dataprovider::ExtensionsFilter;
    use crate::ssh::channel::MockChannel;
    use crate::ssh::command::tests::command;
    use tempfile::tempdir;

    #[test]
    fn test_known_digests() {
        assert_eq!(HashAlgorithm::Md5.hash_bytes(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            HashAlgorithm::Sha1.hash_bytes(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            HashAlgorithm::Sha256.hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(HashAlgorithm::Sha384.hash_bytes(b"").len(), 96);
        assert_eq!(HashAlgorithm::Sha512.hash_bytes(b"").len(), 128);
        assert_eq!(HashAlgorithm::from_command("sha224sum"), None);
    }

    #[tokio::test]
    async fn test_hash_file() {
        let home = tempdir().unwrap();
        std::fs::write(home.path().join("file.txt"), b"abc").unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let mut channel = MockChannel::new(Vec::new());

        command(&conn, "md5sum file.txt")
            .handle(&mut channel, &ActiveConnections::new())
            .await
            .unwrap();

        assert_eq!(channel.output_string(), "900150983cd24fb0d6963f7d28e17f72  /file.txt\n");
        assert_eq!(channel.exit_status, Some(0));
    }

    #[tokio::test]
    async fn test_hash_stdin() {
        let home = tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let mut channel = MockChannel::new(b"abc".to_vec());
        command(&conn, "sha1sum")
            .handle(&mut channel, &ActiveConnections::new())
            .await
            .unwrap();
        assert_eq!(channel.output_string(), "a9993e364706816aba3e25717850c26c9cd0d89d  -\n");

        let mut channel = MockChannel::new(Vec::new()).with_read_error("stdin closed");
        let err = command(&conn, "md5sum")
            .handle(&mut channel, &ActiveConnections::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "stdin closed");
        assert_eq!(channel.exit_status, Some(1));
    }

    #[tokio::test]
    async fn test_hash_denied() {
        let home = tempdir().unwrap();
        std::fs::create_dir(home.path().join("subdir")).unwrap();
        std::fs::write(home.path().join("subdir/test.png"), b"png").unwrap();
        let mut user = test_user(home.path());
        user.filters.file_extensions = vec![ExtensionsFilter {
            path: "/subdir".to_string(),
            allowed_extensions: vec![".jpg".to_string()],
            denied_extensions: vec![],
        }];
        user.permissions.insert("/private".to_string(), vec![Permission::Download]);
        let conn = test_connection(user, Protocol::Ssh);

        let mut channel = MockChannel::new(Vec::new());
        let err = command(&conn, "md5sum subdir/test.png")
            .handle(&mut channel, &ActiveConnections::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SftpdError::PermissionDenied));

        let mut channel = MockChannel::new(Vec::new());
        let err = command(&conn, "sha256sum /private/file")
            .handle(&mut channel, &ActiveConnections::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SftpdError::PermissionDenied));
    }
}
