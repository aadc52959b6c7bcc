//! User model and quota bookkeeping
//!
//! The user store itself is external; this module holds the in-memory view
//! the engine works with: permissions by virtual path, extension filters,
//! virtual folders and live quota usage.

pub mod provider;
pub mod quota;
pub mod user;

pub use provider::{MemoryUserProvider, UserProvider};
pub use quota::{scan_user_quota, ActiveQuotaScan, QuotaScans, QuotaStore, QuotaUsage};
pub use user::{ExtensionsFilter, Permission, User, UserFilters};
