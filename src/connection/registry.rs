//! Active connections registry
//!
//! Service object tracking the sessions currently served, with a status
//! snapshot per connection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::{Connection, Protocol};
use crate::transfer::TransferDirection;

/// Snapshot of a transfer in flight
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTransfer {
    pub id: u64,
    pub direction: TransferDirection,
    pub start_time: DateTime<Utc>,
    pub size: u64,
    pub virtual_path: String,
}

impl ConnectionTransfer {
    fn as_status_string(&self, now: DateTime<Utc>) -> String {
        let op = match self.direction {
            TransferDirection::Upload => "UL",
            TransferDirection::Download => "DL",
        };
        let mut result = format!("{} {:?} ", op, self.virtual_path);
        if self.size > 0 {
            let elapsed = now - self.start_time;
            let elapsed_ms = elapsed.num_milliseconds().max(1);
            let speed = self.size as f64 / elapsed_ms as f64;
            result.push_str(&format!(
                "Size: {:?} Elapsed: {:?} Speed: \"{:.1} KB/s\"",
                byte_count_si(self.size),
                duration_as_string(elapsed),
                speed
            ));
        }
        result
    }
}

/// Snapshot of an active connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub username: String,
    pub connection_id: String,
    pub client_version: String,
    pub remote_address: String,
    pub connection_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub protocol: Protocol,
    pub command: String,
    pub transfers: Vec<ConnectionTransfer>,
}

impl ConnectionStatus {
    pub fn get_connection_duration(&self) -> String {
        duration_as_string(Utc::now() - self.connection_time)
    }

    pub fn get_connection_info(&self) -> String {
        let mut info = format!(
            "{}. Client: {:?} From: {:?}",
            self.protocol, self.client_version, self.remote_address
        );
        if !self.command.is_empty() {
            info.push_str(&format!(" Command: {:?}", self.command));
        }
        info
    }

    pub fn get_transfers_as_string(&self) -> String {
        let now = Utc::now();
        self.transfers
            .iter()
            .map(|t| t.as_status_string(now))
            .collect::<Vec<_>>()
            .join(". ")
    }
}

/// Sessions currently served
#[derive(Debug, Default)]
pub struct ActiveConnections {
    connections: RwLock<Vec<Arc<Connection>>>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        debug!(connection_id = %conn.id(), "connection added");
        self.connections.write().push(conn);
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.write();
        match connections.iter().position(|c| c.id() == connection_id) {
            Some(idx) => {
                connections.remove(idx);
                debug!(connection_id = %connection_id, "connection removed, active: {}", connections.len());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.id() == connection_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn get_stats(&self) -> Vec<ConnectionStatus> {
        self.connections.read().iter().map(|c| c.get_status()).collect()
    }

    /// Register `conn` until the returned guard is dropped
    pub fn track(&self, conn: Arc<Connection>) -> ConnectionGuard<'_> {
        let connection_id = conn.id().to_string();
        self.add(conn);
        ConnectionGuard {
            registry: self,
            connection_id,
        }
    }
}

/// RAII guard that removes a connection from [`ActiveConnections`] on drop,
/// including when the command handler unwinds.
pub struct ConnectionGuard<'a> {
    registry: &'a ActiveConnections,
    connection_id: String,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.connection_id);
    }
}

/// Human readable byte count using SI units
pub fn byte_count_si(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let units = ['k', 'M', 'G', 'T', 'P', 'E'];
    format!("{:.1} {}B", bytes as f64 / div as f64, units[exp])
}

/// `MM:SS`, or `HH:MM:SS` past one hour
pub fn duration_as_string(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{test_connection, test_user};

    #[test]
    fn test_track_and_stats() {
        let home = tempfile::tempdir().unwrap();
        let registry = ActiveConnections::new();
        let conn = test_connection(test_user(home.path()), Protocol::Scp);
        {
            let _guard = registry.track(conn.clone());
            let t = conn.add_transfer(TransferDirection::Upload, "/file.txt");
            t.add_bytes(2048);
            let stats = registry.get_stats();
            assert_eq!(stats.len(), 1);
            assert_eq!(stats[0].protocol, Protocol::Scp);
            let transfers = stats[0].get_transfers_as_string();
            assert!(transfers.starts_with("UL \"/file.txt\" Size: \"2.0 kB\""));
            assert!(registry.get(conn.id()).is_some());
        }
        assert!(registry.is_empty());
        assert!(!registry.remove("missing"));
    }

    #[test]
    fn test_connection_info() {
        let home = tempfile::tempdir().unwrap();
        let conn = test_connection(test_user(home.path()), Protocol::Ssh);
        let info = conn.get_status().get_connection_info();
        assert!(info.starts_with("SSH. Client:"));
        assert!(!info.contains("Command"));
        conn.set_command("sha1sum /a");
        let status = conn.get_status();
        assert!(status.get_connection_info().ends_with("Command: \"sha1sum /a\""));
        assert_eq!(status.get_connection_duration(), "00:00");
    }

    #[test]
    fn test_formatting_helpers() {
        assert_eq!(byte_count_si(999), "999 B");
        assert_eq!(byte_count_si(1500), "1.5 kB");
        assert_eq!(byte_count_si(2_500_000), "2.5 MB");
        assert_eq!(duration_as_string(chrono::Duration::seconds(75)), "01:15");
        assert_eq!(duration_as_string(chrono::Duration::seconds(3725)), "01:02:05");
    }
}
