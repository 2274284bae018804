//! Lease manager configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::locking::types::DEFAULT_KEY_PREFIX;

/// Environment variable holding the store URL
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Store endpoint used when nothing is configured
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Characters with meaning in a `KEYS` pattern
const GLOB_METACHARACTERS: [char; 5] = ['*', '?', '[', ']', '\\'];

/// Configuration for the lock manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Coordination store URL (`redis://` or `rediss://`)
    pub redis_url: String,

    /// Namespace prepended to every record id
    pub key_prefix: String,

    /// TTL used by `acquire_default`
    pub default_ttl: Duration,

    /// Ceiling for any lease TTL; longer requests are capped
    pub max_ttl: Duration,

    /// Age bound used by `cleanup_default` and the reaper
    pub cleanup_max_age: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: Duration::from_secs(5),
            max_ttl: Duration::from_secs(3600), // 1 hour
            cleanup_max_age: Duration::from_secs(60),
        }
    }
}

impl LeaseConfig {
    /// Defaults, with the store URL taken from `REDIS_URL` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var(REDIS_URL_ENV) {
            if !url.trim().is_empty() {
                config.redis_url = url.trim().to_string();
            }
        }
        config
    }

    /// Set the store URL
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Set the key namespace
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default TTL
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the TTL ceiling
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Set the cleanup age bound
    pub fn with_cleanup_max_age(mut self, age: Duration) -> Self {
        self.cleanup_max_age = age;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.redis_url.starts_with("redis://") || self.redis_url.starts_with("rediss://")) {
            return Err(Error::Config(
                "redis_url must start with 'redis://' or 'rediss://', \
                 e.g. redis://localhost:6379 or redis://:password@localhost:6379"
                    .to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(Error::Config("key_prefix must not be empty".to_string()));
        }
        if self
            .key_prefix
            .chars()
            .any(|c| c.is_whitespace() || GLOB_METACHARACTERS.contains(&c))
        {
            return Err(Error::Config(format!(
                "key_prefix '{}' must not contain whitespace or any of {:?}",
                self.key_prefix, GLOB_METACHARACTERS
            )));
        }

        if self.max_ttl.as_millis() == 0 {
            return Err(Error::Config("max_ttl must be at least 1ms".to_string()));
        }
        if self.default_ttl.as_millis() == 0 || self.default_ttl > self.max_ttl {
            return Err(Error::Config(format!(
                "default_ttl must be between 1ms and max_ttl ({}s)",
                self.max_ttl.as_secs()
            )));
        }
        if self.cleanup_max_age.as_secs() == 0 {
            return Err(Error::Config("cleanup_max_age must be at least 1s".to_string()));
        }

        Ok(())
    }

    /// Apply the TTL bounds: reject sub-millisecond TTLs, cap at `max_ttl`
    pub fn bound_ttl(&self, ttl: Duration) -> Result<Duration> {
        if ttl.as_millis() == 0 {
            return Err(Error::InvalidTtl(format!(
                "lease TTL must be at least 1ms, got {:?}",
                ttl
            )));
        }
        if ttl > self.max_ttl {
            warn!(
                requested_ms = ttl.as_millis() as u64,
                max_ttl_ms = self.max_ttl.as_millis() as u64,
                "Lease TTL above ceiling; capping"
            );
            return Ok(self.max_ttl);
        }
        Ok(ttl)
    }

    /// `KEYS` pattern matching every lease in this namespace
    pub fn key_pattern(&self) -> String {
        format!("{}:*", self.key_prefix)
    }
}
