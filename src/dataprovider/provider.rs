//! User lookup used at authentication time

use std::path::Path;

use dashmap::DashMap;
use tracing::info;

use super::User;
use crate::error::{Result, SftpdError};

/// Source of the users allowed to log in
pub trait UserProvider: Send + Sync {
    fn get_user(&self, username: &str) -> Option<User>;
}

/// Users kept in memory, keyed by name
#[derive(Debug, Default)]
pub struct MemoryUserProvider {
    users: DashMap<String, User>,
}

impl MemoryUserProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user
    pub fn add_user(&self, user: User) {
        self.users.insert(user.username.clone(), user);
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.users.remove(username).is_some()
    }

    /// Load users from a JSON array of user objects
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let users: Vec<User> = serde_json::from_str(&contents)
            .map_err(|e| SftpdError::Config(format!("invalid users file {:?}: {}", path, e)))?;
        let provider = Self::new();
        for user in users {
            provider.add_user(user);
        }
        info!("{} users loaded from {:?}", provider.users.len(), path);
        Ok(provider)
    }
}

impl UserProvider for MemoryUserProvider {
    fn get_user(&self, username: &str) -> Option<User> {
        self.users.get(username).map(|u| u.clone())
    }
}
