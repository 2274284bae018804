//! Lease keys, owner tokens, and lease snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::KeyTtl;

/// Namespace used when no prefix is configured
pub const DEFAULT_KEY_PREFIX: &str = "audit_lock";

/// Length of a hyphenated UUID, the only accepted owner token shape
const TOKEN_LEN: usize = 36;
const TOKEN_HYPHENS: usize = 4;

/// Namespaced coordination-store key for one record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    key: String,
    prefix_len: usize,
}

impl LeaseKey {
    /// Build `{prefix}:{record_id}`; empty record ids are rejected
    pub fn build(prefix: &str, record_id: &str) -> Result<Self> {
        if record_id.is_empty() {
            return Err(Error::InvalidKey(
                "record id must be a non-empty string".to_string(),
            ));
        }
        Ok(Self {
            key: format!("{}:{}", prefix, record_id),
            prefix_len: prefix.len(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn prefix(&self) -> &str {
        &self.key[..self.prefix_len]
    }

    pub fn record_id(&self) -> &str {
        &self.key[self.prefix_len + 1..]
    }
}

impl Deref for LeaseKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.key
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Build a lease key in the default `audit_lock` namespace
pub fn build_key(record_id: &str) -> Result<LeaseKey> {
    LeaseKey::build(DEFAULT_KEY_PREFIX, record_id)
}

/// Proof of ownership stored as the lease value
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Fresh random token for a new acquisition
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a token handed over out of band
    pub fn parse(raw: &str) -> Result<Self> {
        validate_token(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for OwnerToken {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Tokens are credentials; keep them out of debug logs.
impl fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head: String = self.0.chars().take(8).collect();
        write!(f, "OwnerToken({}…)", head)
    }
}

/// Check the fixed UUID shape: 36 characters, 4 hyphens
pub(crate) fn validate_token(raw: &str) -> Result<()> {
    if raw.len() != TOKEN_LEN || raw.matches('-').count() != TOKEN_HYPHENS {
        return Err(Error::InvalidOwnership(format!(
            "owner token must be a {}-character UUID with {} hyphens",
            TOKEN_LEN, TOKEN_HYPHENS
        )));
    }
    Ok(())
}

/// Lifecycle of one lease handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Created by `acquire`, store not yet written
    Unentered,
    /// The conditional set succeeded; this handle owns the key
    Held,
    /// Released by this handle (or found lost at release time)
    Released,
    /// The key was already held, or the acquire request failed
    FailedToAcquire,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unentered => write!(f, "unentered"),
            Self::Held => write!(f, "held"),
            Self::Released => write!(f, "released"),
            Self::FailedToAcquire => write!(f, "failed_to_acquire"),
        }
    }
}

/// Point-in-time view of a lease as seen in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Full store key
    pub key: String,

    /// Record id the key was built from
    pub record_id: String,

    /// Remaining lifetime reported by the store
    pub ttl: KeyTtl,

    /// When the store was queried
    pub observed_at: DateTime<Utc>,

    /// Projected expiry (None when the key carries no TTL)
    pub expires_at: Option<DateTime<Utc>>,
}

impl LeaseInfo {
    pub(crate) fn new(key: &LeaseKey, ttl: KeyTtl) -> Self {
        let observed_at = Utc::now();
        let expires_at = match ttl {
            KeyTtl::Expires(secs) => Some(observed_at + chrono::Duration::seconds(secs as i64)),
            _ => None,
        };
        Self {
            key: key.as_str().to_string(),
            record_id: key.record_id().to_string(),
            ttl,
            observed_at,
            expires_at,
        }
    }
}
