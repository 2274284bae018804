//! Leasehold Core Library
//!
//! This crate provides distributed per-record leases over a shared
//! key-value store, including:
//! - Lock manager with lazy connection and release-script preloading
//! - Lease handles that release atomically on every exit path
//! - Ownership-checked and administrative release
//! - Cleanup of leases abandoned by crashed holders, on demand or periodic
//! - Redis and in-memory store drivers

pub mod config;
pub mod error;
pub mod locking;
pub mod store;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::LeaseConfig;
    pub use crate::error::{Error, Result};
    pub use crate::locking::{LeaseHandle, LeaseState, LockManager, Reaper, build_key};
    pub use crate::store::{MemoryBackend, RedisBackend};
}
