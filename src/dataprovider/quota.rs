//! Quota Tracking
//!
//! Live per-user usage counters and the registry of running quota scans.
//! Both are service objects shared through `Arc`, not globals.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::user::User;
use crate::error::Result;
use crate::vfs::Fs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub files: i64,
    pub size: i64,
}

/// Per-user usage counters
///
/// Updates go through the map entry, so concurrent transfers closing for
/// the same user cannot lose updates.
#[derive(Debug, Default)]
pub struct QuotaStore {
    usage: DashMap<String, QuotaUsage>,
}

impl QuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the counters from the stored user, keeping live values if the
    /// user is already tracked.
    pub fn register_user(&self, user: &User) {
        self.usage
            .entry(user.username.clone())
            .or_insert(QuotaUsage {
                files: user.used_quota_files,
                size: user.used_quota_size,
            });
    }

    pub fn get_used_quota(&self, username: &str) -> Option<QuotaUsage> {
        self.usage.get(username).map(|u| *u)
    }

    /// Apply a delta, clamping the counters at zero
    pub fn update_quota(&self, username: &str, files: i64, size: i64) -> QuotaUsage {
        let mut entry = self.usage.entry(username.to_string()).or_default();
        entry.files = (entry.files + files).max(0);
        entry.size = (entry.size + size).max(0);
        debug!(
            "quota updated for user {:?}, files delta: {}, size delta: {}, now: {:?}",
            username, files, size, *entry
        );
        *entry
    }

    pub fn set_quota(&self, username: &str, usage: QuotaUsage) {
        self.usage.insert(username.to_string(), usage);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveQuotaScan {
    pub username: String,
    pub start_time: DateTime<Utc>,
}

/// Registry of running quota scans, at most one per user
#[derive(Debug, Default)]
pub struct QuotaScans {
    scans: Mutex<Vec<ActiveQuotaScan>>,
}

impl QuotaScans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scan, returns false if one is already running for the user
    pub fn add(&self, username: &str) -> bool {
        let mut scans = self.scans.lock();
        if scans.iter().any(|s| s.username == username) {
            return false;
        }
        scans.push(ActiveQuotaScan {
            username: username.to_string(),
            start_time: Utc::now(),
        });
        true
    }

    /// Deregister a scan, returns false if none was running for the user
    pub fn remove(&self, username: &str) -> bool {
        let mut scans = self.scans.lock();
        match scans.iter().position(|s| s.username == username) {
            Some(idx) => {
                scans.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<ActiveQuotaScan> {
        self.scans.lock().clone()
    }
}

/// Removes the scan from the registry when dropped
struct ScanGuard<'a> {
    scans: &'a QuotaScans,
    username: &'a str,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.scans.remove(self.username);
    }
}

/// Recompute the user's usage from the home dir and reset the counters.
///
/// Returns `Ok(None)` when a scan for the same user is already running.
pub fn scan_user_quota(
    user: &User,
    fs: &dyn Fs,
    store: &QuotaStore,
    scans: &QuotaScans,
) -> Result<Option<QuotaUsage>> {
    if !scans.add(&user.username) {
        debug!("quota scan already running for user {:?}", user.username);
        return Ok(None);
    }
    let _guard = ScanGuard {
        scans,
        username: &user.username,
    };
    let (files, size) = fs.get_dir_size(&user.home_dir)?;
    let usage = QuotaUsage {
        files: files as i64,
        size: size as i64,
    };
    store.set_quota(&user.username, usage);
    info!(
        "quota scan completed for user {:?}, files: {}, size: {}",
        user.username, files, size
    );
    Ok(Some(usage))
}
