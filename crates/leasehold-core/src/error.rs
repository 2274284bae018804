//! Error types for Leasehold

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias using Leasehold's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Lease errors with stable codes and operator suggestions
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Store errors (E300-E309)
    #[error("Coordination store unreachable: {0}. Check REDIS_URL and that the store is running.")]
    Connectivity(String),

    #[error("Coordination store rejected the command: {0}")]
    StoreRejected(String),

    // Contention (E310-E319)
    #[error("Lease unavailable: '{key}' is held by another owner")]
    LeaseUnavailable { key: String },

    #[error("Lease '{key}' is not held by this owner (expired, released, or taken over)")]
    NotOwner { key: String },

    // Programming errors (E320-E329)
    #[error("Invalid record id: {0}")]
    InvalidKey(String),

    #[error("Invalid owner token: {0}")]
    InvalidOwnership(String),

    #[error("Invalid lease TTL: {0}")]
    InvalidTtl(String),

    #[error("Invalid lease state: {0}")]
    InvalidState(String),

    // Release failures (E330-E339)
    #[error("Release script failed for '{key}': {message}. Lease state is unknown; check `leasehold status`.")]
    ScriptExecution { key: String, message: String },

    // Config errors (E340-E349)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "E300",
            Self::StoreRejected(_) => "E301",
            Self::LeaseUnavailable { .. } => "E310",
            Self::NotOwner { .. } => "E311",
            Self::InvalidKey(_) => "E320",
            Self::InvalidOwnership(_) => "E321",
            Self::InvalidTtl(_) => "E322",
            Self::InvalidState(_) => "E323",
            Self::ScriptExecution { .. } => "E330",
            Self::Config(_) => "E340",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Connectivity(_) => Some("leasehold --redis-url <url> status <record_id>".to_string()),
            Self::LeaseUnavailable { key } => Some(format!("leasehold status {}", record_part(key))),
            Self::ScriptExecution { key, .. } => {
                Some(format!("leasehold status {}", record_part(key)))
            }
            _ => None,
        }
    }

    /// Whether this error is ordinary contention rather than a fault
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LeaseUnavailable { .. })
    }

    /// Map a store failure outside of the release path
    ///
    /// Only transport and authentication failures are connectivity errors;
    /// a reachable store refusing a command (`READONLY`, `OOM`, `WRONGTYPE`)
    /// keeps its own message.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Connection(message) => Self::Connectivity(message),
            other => Self::StoreRejected(other.to_string()),
        }
    }
}

/// Strip the namespace from a lease key for display in suggestions
fn record_part(key: &str) -> &str {
    key.split_once(':').map(|(_, id)| id).unwrap_or(key)
}
