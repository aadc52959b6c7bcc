//! russh session handler
//!
//! Authenticates users against the provider (public keys or certificates
//! signed by a trusted CA) and routes session channels to the SFTP
//! subsystem or to the exec command engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::ssh_key::{Certificate, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use tracing::{debug, info, warn};

use super::ServerState;
use crate::connection::{Connection, Protocol};
use crate::dataprovider::User;
use crate::error::SftpdError;
use crate::sftp::serve_subsystem;
use crate::ssh::{parse_command_payload, SessionChannel, SshCommand};

pub struct SessionHandler {
    state: Arc<ServerState>,
    peer: SocketAddr,
    user: Option<User>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SessionHandler {
    pub fn new(state: Arc<ServerState>, peer: SocketAddr) -> Self {
        Self {
            state,
            peer,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn new_connection(&self, user: User, protocol: Protocol, session: &Session) -> Arc<Connection> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let fs = user.get_filesystem(&id);
        let client_version = String::from_utf8_lossy(session.remote_sshid()).into_owned();
        Arc::new(
            Connection::new(id, protocol, user, fs, self.state.quota.clone())
                .with_upload_mode(self.state.configuration.upload_mode)
                .with_client_info(client_version, self.peer.to_string()),
        )
    }

    /// The authenticated user and the session channel, when both exist
    fn take_channel(&mut self, channel_id: ChannelId) -> Option<(User, Channel<Msg>)> {
        let user = self.user.clone()?;
        let channel = self.channels.remove(&channel_id)?;
        Some((user, channel))
    }
}

impl Handler for SessionHandler {
    type Error = SftpdError;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        match self.state.users.get_user(user) {
            Some(found) if found.is_authorized_key(public_key) => {
                info!(peer = %self.peer, "public key login accepted for user {:?}", user);
                self.user = Some(found);
                Ok(Auth::Accept)
            }
            _ => {
                warn!(peer = %self.peer, "public key login rejected for user {:?}", user);
                Ok(Auth::reject())
            }
        }
    }

    async fn auth_openssh_certificate(&mut self, user: &str, certificate: &Certificate) -> Result<Auth, Self::Error> {
        if self.state.trusted_cas.is_empty() {
            return Ok(Auth::reject());
        }
        let Some(found) = self.state.users.get_user(user) else {
            warn!(peer = %self.peer, "certificate login for unknown user {:?}", user);
            return Ok(Auth::reject());
        };
        match self.state.trusted_cas.check_user_certificate(certificate, user) {
            Ok(()) => {
                info!(peer = %self.peer, "certificate login accepted for user {:?}", user);
                self.user = Some(found);
                Ok(Auth::Accept)
            }
            Err(_) => Ok(Auth::reject()),
        }
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(&mut self, channel_id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let Some((user, channel)) = self.take_channel(channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        let payload = String::from_utf8_lossy(data).into_owned();
        let protocol = match parse_command_payload(&payload) {
            Ok((name, _)) if name == "scp" => Protocol::Scp,
            _ => Protocol::Ssh,
        };
        let connection = self.new_connection(user, protocol, session);
        let command = match SshCommand::parse(connection, &payload, &self.state.configuration.enabled_ssh_commands) {
            Ok(command) => command,
            Err(e) => {
                debug!(peer = %self.peer, "exec request {:?} refused: {}", payload, e);
                self.channels.insert(channel_id, channel);
                let _ = session.channel_failure(channel_id);
                return Ok(());
            }
        };
        let _ = session.channel_success(channel_id);

        let connections = self.state.connections.clone();
        let mut channel = SessionChannel::new(channel, session.handle());
        tokio::spawn(async move {
            if let Err(e) = command.handle(&mut channel, &connections).await {
                debug!("command {} ended with error: {}", command, e);
            }
            channel.close().await;
        });
        Ok(())
    }

    async fn subsystem_request(&mut self, channel_id: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        if name != "sftp" {
            warn!(peer = %self.peer, "unsupported subsystem {:?}", name);
            let _ = session.channel_failure(channel_id);
            return Ok(());
        }
        let Some((user, channel)) = self.take_channel(channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        let connection = self.new_connection(user, Protocol::Sftp, session);
        let _ = session.channel_success(channel_id);

        let connections = self.state.connections.clone();
        let handle = session.handle();
        tokio::spawn(async move {
            let stream = Box::pin(channel.into_stream());
            if let Err(e) = serve_subsystem(connection, stream, &connections).await {
                debug!("sftp subsystem error: {}", e);
            }
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        Ok(())
    }
}
