//! Distributed per-record leases
//!
//! This module serializes work on individual records across processes that
//! share one coordination store. Every guarantee comes from the store's
//! atomic primitives; nothing here relies on in-process locks.
//!
//! # Architecture
//!
//! - **Key Builder**: `LeaseKey` / `build_key` map record ids to `{prefix}:{id}`
//! - **Lock Manager**: `LockManager` owns the connection and hands out leases
//! - **Lease Handle**: `LeaseHandle` acquires with `SET NX PX` and releases
//!   through an ownership-checked script on every exit path
//! - **Reaper**: `Reaper` runs the manager's cleanup sweep on an interval
//!
//! # Example
//!
//! ```ignore
//! use leasehold_core::locking::LockManager;
//! use leasehold_core::config::LeaseConfig;
//!
//! let manager = LockManager::redis(LeaseConfig::from_env())?;
//!
//! match manager.with_lease(&memory_id, Duration::from_secs(30), || audit(&memory)).await {
//!     Ok(outcome) => outcome?,
//!     Err(e) if e.is_contention() => return Ok(()), // another process has it
//!     Err(e) => return Err(e.into()),
//! }
//! ```

pub mod guard;
pub mod manager;
pub mod reaper;
pub mod script;
pub mod types;

// Re-export main types
pub use guard::LeaseHandle;
pub use manager::LockManager;
pub use reaper::Reaper;
pub use script::RELEASE_SCRIPT;
pub use types::{DEFAULT_KEY_PREFIX, LeaseInfo, LeaseKey, LeaseState, OwnerToken, build_key};
