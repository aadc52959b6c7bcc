use std::path::PathBuf;
use std::sync::Arc;

use sftpd::config::ConfigStorage;
use sftpd::dataprovider::MemoryUserProvider;
use sftpd::server::SshServer;
use tracing::error;

/// Usage: `sftpd [config file]`
///
/// Users are read from `users.json` next to the configuration file.
#[tokio::main]
async fn main() {
    sftpd::init_logging();

    if let Err(e) = run().await {
        error!("sftpd stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let storage = match std::env::args_os().nth(1) {
        Some(path) => ConfigStorage::with_path(PathBuf::from(path)),
        None => ConfigStorage::new()?,
    };
    let configuration = storage.load().await?;
    let config_dir = storage.config_dir().to_path_buf();
    let users = MemoryUserProvider::load_file(&config_dir.join("users.json"))?;

    let server = SshServer::new(configuration, &config_dir, Arc::new(users))?;
    server.run().await?;
    Ok(())
}
