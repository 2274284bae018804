//! Coordination store drivers
//!
//! The lease layer talks to the shared key-value store through two traits:
//! a [`StoreBackend`] that opens connections, and a [`StoreConnection`]
//! exposing exactly the primitives leases need (conditional set with
//! expiry, atomic scripted release, existence, delete, TTL introspection,
//! and namespace enumeration).
//!
//! - [`RedisBackend`]: the production driver over a multiplexed Redis
//!   connection manager.
//! - [`MemoryBackend`]: an in-process store with the same semantics, shared
//!   by every manager built on it. Used by tests and single-host setups.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by a store driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached, or the connection dropped
    #[error("connection failed: {0}")]
    Connection(String),

    /// The script handle is not in the store's script cache
    #[error("script not loaded in store cache")]
    NoScript,

    /// A server-side script raised an error
    #[error("script error: {0}")]
    Script(String),

    /// Any other command failure
    #[error("command failed: {0}")]
    Command(String),
}

/// Content-addressed handle of a script loaded into the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remaining lifetime of a key as reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "secs")]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists but carries no expiry
    Persistent,
    /// The key expires after this many whole seconds
    Expires(u64),
}

impl KeyTtl {
    /// Decode the integer reply of a `TTL` command
    pub fn from_reply(reply: i64) -> Self {
        match reply {
            -2 => Self::Missing,
            -1 => Self::Persistent,
            secs if secs >= 0 => Self::Expires(secs as u64),
            _ => Self::Missing,
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Opens connections to a coordination store
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Establish a new connection
    async fn open(&self) -> StoreResult<Arc<dyn StoreConnection>>;

    /// Human-readable endpoint, safe for logs
    fn endpoint(&self) -> String;
}

/// One live connection to the coordination store
///
/// Implementations must be safe to share across tasks; independent requests
/// may interleave on the same connection.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Round-trip liveness check
    async fn ping(&self) -> StoreResult<()>;

    /// `SET key value NX PX ttl`; true when the key was written
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// `SCRIPT LOAD`; returns the content-addressed handle
    async fn script_load(&self, script: &str) -> StoreResult<ScriptHandle>;

    /// `EVALSHA handle 1 key arg`; `StoreError::NoScript` when not cached
    async fn eval_sha(&self, handle: &ScriptHandle, key: &str, arg: &str) -> StoreResult<i64>;

    /// `EVAL script 1 key arg`
    async fn eval(&self, script: &str, key: &str, arg: &str) -> StoreResult<i64>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// `DEL key`; true when a key was removed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// `TTL key`
    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// `EXPIRE key secs`; true when the key existed
    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool>;

    /// `KEYS pattern`
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Close the connection; further calls may fail
    async fn close(&self) {}
}
