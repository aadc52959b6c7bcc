//! SSH server
//!
//! Accept loop with backoff on temporary errors, one task per session, and
//! the glue between the configuration, host keys and the russh handler.

mod handler;

pub use handler::SessionHandler;

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::connection::ActiveConnections;
use crate::dataprovider::{QuotaStore, UserProvider};
use crate::error::Result;
use crate::ssh::{check_and_load_host_keys, TrustedCaKeys};

const INITIAL_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

// errno values reported when the process or system runs out of resources
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;
const ENOBUFS: i32 = 105;
const ENOMEM: i32 = 12;

/// State shared by every session of a server
pub struct ServerState {
    pub configuration: Configuration,
    pub users: Arc<dyn UserProvider>,
    pub trusted_cas: TrustedCaKeys,
    pub quota: Arc<QuotaStore>,
    pub connections: Arc<ActiveConnections>,
}

/// Source of incoming connections
#[async_trait]
pub trait Acceptor: Send {
    type Stream: Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Runs a single accepted session to completion
#[async_trait]
pub trait SessionRunner<S>: Send + Sync + 'static {
    async fn run_session(&self, stream: S, peer: SocketAddr) -> Result<()>;
}

/// Errors after which accepting again may succeed
pub fn is_temporary_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(err.raw_os_error(), Some(EMFILE | ENFILE | ENOBUFS | ENOMEM))
}

/// Accept connections until a non temporary error occurs.
///
/// Every session runs in its own task; a failing or panicking session
/// never stops the loop.
pub async fn serve<A, R>(mut acceptor: A, runner: Arc<R>) -> Result<()>
where
    A: Acceptor,
    R: SessionRunner<A::Stream>,
{
    let mut delay = Duration::ZERO;
    loop {
        let (stream, peer) = match acceptor.accept().await {
            Ok(accepted) => accepted,
            Err(e) if is_temporary_accept_error(&e) => {
                delay = if delay.is_zero() {
                    INITIAL_ACCEPT_DELAY
                } else {
                    (delay * 2).min(MAX_ACCEPT_DELAY)
                };
                warn!("temporary accept error: {}, retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) => {
                error!("accept failed: {}", e);
                return Err(e.into());
            }
        };
        delay = Duration::ZERO;
        debug!("accepted connection from {}", peer);

        let runner = runner.clone();
        let session = tokio::spawn(async move { runner.run_session(stream, peer).await });
        tokio::spawn(async move {
            match session.await {
                Ok(Ok(())) => debug!("session from {} ended", peer),
                Ok(Err(e)) => warn!("session from {} failed: {}", peer, e),
                Err(e) if e.is_panic() => error!("session from {} panicked", peer),
                Err(e) => warn!("session from {} aborted: {}", peer, e),
            }
        });
    }
}

/// SSH server bound to a configuration and a user provider
pub struct SshServer {
    config: Arc<russh::server::Config>,
    state: Arc<ServerState>,
}

impl SshServer {
    /// Load host keys and trusted CAs. Relative key paths are resolved
    /// against `config_dir`.
    pub fn new(mut configuration: Configuration, config_dir: &Path, users: Arc<dyn UserProvider>) -> Result<Self> {
        configuration.validate();
        let keys = check_and_load_host_keys(config_dir, &configuration.host_keys)?;
        let trusted_cas = TrustedCaKeys::load(config_dir, &configuration.trusted_user_ca_keys)?;
        let config = Arc::new(configuration.russh_config(keys));
        let state = ServerState {
            configuration,
            users,
            trusted_cas,
            quota: Arc::new(QuotaStore::new()),
            connections: Arc::new(ActiveConnections::new()),
        };
        Ok(Self {
            config,
            state: Arc::new(state),
        })
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Bind the configured address and serve until a fatal accept error
    pub async fn run(self) -> Result<()> {
        let address = self.state.configuration.listen_address();
        let listener = TcpListener::bind(&address).await?;
        info!("SSH server listening on {}", address);
        serve(listener, Arc::new(self)).await
    }
}

#[async_trait]
impl SessionRunner<TcpStream> for SshServer {
    async fn run_session(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let handler = SessionHandler::new(self.state.clone(), peer);
        let session = russh::server::run_stream(self.config.clone(), stream, handler).await?;
        session.await
    }
}
