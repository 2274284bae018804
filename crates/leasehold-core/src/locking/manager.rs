//! Lock manager for per-record leases
//!
//! The lock manager owns one coordination-store connection and hands out
//! lease handles bound to it. It handles:
//! - Connection lifecycle and release-script preloading
//! - Key construction and TTL bounds
//! - Administrative inspection and force release
//! - Best-effort cleanup of leases left behind by crashed holders
//!
//! All mutual exclusion is enforced by the store; the manager keeps no
//! in-process record of who holds what.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::guard::LeaseHandle;
use super::script::{RELEASE_SCRIPT, release_atomically};
use super::types::{LeaseInfo, LeaseKey, OwnerToken};
use crate::config::LeaseConfig;
use crate::error::{Error, Result};
use crate::store::{
    KeyTtl, RedisBackend, ScriptHandle, StoreBackend, StoreConnection, StoreError, StoreResult,
};

/// Live connection plus the cached release-script handle
#[derive(Clone)]
struct Session {
    conn: Arc<dyn StoreConnection>,
    release_script: Option<ScriptHandle>,
}

/// Lock manager for coordinating record leases across processes
pub struct LockManager {
    /// Configuration
    config: LeaseConfig,

    /// Opens store connections
    backend: Arc<dyn StoreBackend>,

    /// Current connection, if any
    session: RwLock<Option<Session>>,
}

impl LockManager {
    /// Create a lock manager over any store backend
    pub fn new(config: LeaseConfig, backend: Arc<dyn StoreBackend>) -> Result<Self> {
        config.validate()?;
        info!(
            endpoint = %backend.endpoint(),
            prefix = %config.key_prefix,
            "Lock manager initialized"
        );
        Ok(Self {
            config,
            backend,
            session: RwLock::new(None),
        })
    }

    /// Create a lock manager backed by the Redis instance at `config.redis_url`
    pub fn redis(config: LeaseConfig) -> Result<Self> {
        let backend = Arc::new(RedisBackend::new(config.redis_url.clone()));
        Self::new(config, backend)
    }

    /// Get the configuration
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Build the store key for a record id
    pub fn key_for(&self, record_id: &str) -> Result<LeaseKey> {
        LeaseKey::build(&self.config.key_prefix, record_id)
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Connect and preload the release script; a no-op when connected
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }

        let conn = self.backend.open().await.map_err(Error::from_store)?;
        conn.ping().await.map_err(Error::from_store)?;

        let release_script = match conn.script_load(RELEASE_SCRIPT).await {
            Ok(handle) => Some(handle),
            Err(StoreError::Connection(message)) => return Err(Error::Connectivity(message)),
            Err(e) => {
                warn!(error = %e, "Could not preload release script; releases will use EVAL");
                None
            }
        };

        info!(endpoint = %self.backend.endpoint(), "Lock manager connected");
        *session = Some(Session {
            conn,
            release_script,
        });
        Ok(())
    }

    /// Close the connection and forget the script handle; a no-op when disconnected
    pub async fn disconnect(&self) {
        let previous = self.session.write().await.take();
        if let Some(session) = previous {
            session.conn.close().await;
            info!(endpoint = %self.backend.endpoint(), "Lock manager disconnected");
        }
    }

    /// Current session, connecting lazily
    async fn session(&self) -> Result<Session> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        self.connect().await?;
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Connectivity("disconnected while connecting".to_string()))
    }

    /// Prepare an unentered lease handle for `record_id`
    ///
    /// `ttl` is the lease lifetime in the store, not a wait timeout. Nothing
    /// is written until `LeaseHandle::enter`.
    pub async fn acquire(&self, record_id: &str, ttl: Duration) -> Result<LeaseHandle> {
        let key = self.key_for(record_id)?;
        let ttl = self.config.bound_ttl(ttl)?;
        let session = self.session().await?;

        Ok(LeaseHandle::new(
            session.conn,
            session.release_script,
            key,
            ttl,
        ))
    }

    /// `acquire` with the configured default TTL
    pub async fn acquire_default(&self, record_id: &str) -> Result<LeaseHandle> {
        self.acquire(record_id, self.config.default_ttl).await
    }

    /// Acquire and enter in one step
    ///
    /// Release is visible to other callers as soon as an awaited
    /// `LeaseHandle::release` (or `with_lease`) returns. Dropping the handle
    /// instead only schedules the release on the runtime, so an immediate
    /// `is_locked` or re-acquire by this process may still see the lease.
    pub async fn lock(&self, record_id: &str, ttl: Duration) -> Result<LeaseHandle> {
        let mut lease = self.acquire(record_id, ttl).await?;
        lease.enter().await?;
        Ok(lease)
    }

    /// Run `body` while holding the lease for `record_id`
    ///
    /// The release is awaited after `body` completes, and its failure is
    /// returned even though `body` ran. On this path the lease is gone by
    /// the time the call returns. If the returned future is dropped or
    /// `body` panics, the handle's drop releases the lease in the background.
    pub async fn with_lease<F, Fut, T>(&self, record_id: &str, ttl: Duration, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut lease = self.lock(record_id, ttl).await?;
        let output = body().await;
        lease.release().await?;
        Ok(output)
    }

    /// Whether a lease currently exists for `record_id`
    ///
    /// For observability only; acting on this answer races with other holders.
    pub async fn is_locked(&self, record_id: &str) -> Result<bool> {
        let key = self.key_for(record_id)?;
        let session = self.session().await?;
        session.conn.exists(&key).await.map_err(Error::from_store)
    }

    /// Snapshot of the lease for `record_id`, if one exists
    pub async fn lease_info(&self, record_id: &str) -> Result<Option<LeaseInfo>> {
        let key = self.key_for(record_id)?;
        let session = self.session().await?;
        let ttl = session.conn.ttl(&key).await.map_err(Error::from_store)?;
        Ok(ttl.exists().then(|| LeaseInfo::new(&key, ttl)))
    }

    /// Delete the lease for `record_id` regardless of owner
    ///
    /// Administrative recovery only. Returns whether a lease was removed.
    pub async fn force_release(&self, record_id: &str) -> Result<bool> {
        let key = self.key_for(record_id)?;
        let session = self.session().await?;
        let removed = session.conn.delete(&key).await.map_err(Error::from_store)?;
        if removed {
            warn!(lock_key = %key, "Lease force-released, ownership not checked");
        }
        Ok(removed)
    }

    /// Ownership-checked release using a token handed over out of band
    ///
    /// Fails with `InvalidOwnership` for a malformed token and `NotOwner`
    /// when the lease is absent or owned by another token; the key is left
    /// untouched in both cases.
    pub async fn release_with_token(&self, record_id: &str, token: &str) -> Result<()> {
        let key = self.key_for(record_id)?;
        let token = OwnerToken::parse(token)?;
        let session = self.session().await?;

        let deleted = release_atomically(
            session.conn.as_ref(),
            session.release_script.as_ref(),
            &key,
            &token,
        )
        .await?;

        if deleted {
            debug!(lock_key = %key, "Lease released by token");
            Ok(())
        } else {
            warn!(lock_key = %key, "Token release refused: lease absent or owned by another token");
            Err(Error::NotOwner {
                key: key.to_string(),
            })
        }
    }

    /// Sweep the namespace for leases outliving `max_age`
    ///
    /// Leases without an expiry get `max_age` as their TTL. Leases whose
    /// remaining TTL exceeds `max_age` are deleted. Returns the number
    /// deleted. Store errors are logged and yield 0.
    ///
    /// The store reports TTLs in whole seconds, so `max_age` is truncated to
    /// seconds and anything under 1s is raised to 1s (with a warning).
    pub async fn cleanup_expired_locks(&self, max_age: Duration) -> u64 {
        if max_age < Duration::from_secs(1) {
            warn!(
                requested_ms = max_age.as_millis() as u64,
                "Cleanup max age below 1s; using 1s"
            );
        }

        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Error cleaning up expired leases");
                return 0;
            }
        };

        match self.sweep(session.conn.as_ref(), max_age).await {
            Ok(cleaned) => {
                if cleaned > 0 {
                    info!(cleaned, "Cleaned up expired leases");
                }
                cleaned
            }
            Err(e) => {
                error!(error = %e, "Error cleaning up expired leases");
                0
            }
        }
    }

    /// `cleanup_expired_locks` with the configured age bound
    pub async fn cleanup_default(&self) -> u64 {
        self.cleanup_expired_locks(self.config.cleanup_max_age).await
    }

    async fn sweep(&self, conn: &dyn StoreConnection, max_age: Duration) -> StoreResult<u64> {
        let max_age_secs = max_age.as_secs().max(1);
        let mut cleaned = 0;

        for key in conn.keys(&self.config.key_pattern()).await? {
            match conn.ttl(&key).await? {
                KeyTtl::Persistent => {
                    conn.expire(&key, max_age_secs).await?;
                    warn!(lock_key = %key, ttl_secs = max_age_secs, "Lease had no expiry; applied max age");
                }
                KeyTtl::Expires(remaining) if remaining > max_age_secs => {
                    if conn.delete(&key).await? {
                        debug!(lock_key = %key, remaining_secs = remaining, "Removed lease outliving max age");
                        cleaned += 1;
                    }
                }
                _ => {}
            }
        }

        Ok(cleaned)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("endpoint", &self.backend.endpoint())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::types::LeaseState;
    use crate::store::MemoryBackend;

    fn create_test_manager(backend: &MemoryBackend) -> LockManager {
        LockManager::new(LeaseConfig::default(), Arc::new(backend.clone()))
            .expect("Failed to create manager")
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);
        assert!(!manager.is_connected().await);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert!(manager.is_connected().await);

        manager.disconnect().await;
        manager.disconnect().await;
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_surfaces_store_failure() {
        let backend = MemoryBackend::new();
        backend.set_unreachable(true);
        let manager = create_test_manager(&backend);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_acquire_connects_lazily_without_writing() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);

        let lease = manager.acquire("memory_42", Duration::from_secs(5)).await.unwrap();
        assert!(manager.is_connected().await);
        assert_eq!(lease.key().as_str(), "audit_lock:memory_42");
        assert_eq!(lease.state(), LeaseState::Unentered);
        assert!(!manager.is_locked("memory_42").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_record_id_never_touches_store() {
        let backend = MemoryBackend::new();
        backend.set_unreachable(true);
        let manager = create_test_manager(&backend);

        assert!(matches!(
            manager.acquire("", Duration::from_secs(5)).await,
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(manager.is_locked("").await, Err(Error::InvalidKey(_))));
        assert!(matches!(manager.force_release("").await, Err(Error::InvalidKey(_))));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_ttl_bounds() {
        let backend = MemoryBackend::new();
        let manager = LockManager::new(
            LeaseConfig::default().with_max_ttl(Duration::from_secs(60)),
            Arc::new(backend.clone()),
        )
        .unwrap();

        let err = manager.acquire("memory_1", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTtl(_)));

        let lease = manager.acquire("memory_1", Duration::from_secs(600)).await.unwrap();
        assert_eq!(lease.ttl(), Duration::from_secs(60));

        let lease = manager.acquire_default("memory_1").await.unwrap();
        assert_eq!(lease.ttl(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let result = LockManager::new(
            LeaseConfig::default().with_key_prefix("audit*"),
            Arc::new(MemoryBackend::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let result = LockManager::redis(LeaseConfig::default().with_redis_url("localhost:6379"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_lock_and_is_locked() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);

        let mut lease = manager.lock("memory_42", Duration::from_secs(5)).await.unwrap();
        assert!(manager.is_locked("memory_42").await.unwrap());

        lease.release().await.unwrap();
        assert!(!manager.is_locked("memory_42").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lease_releases_after_body() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);

        let seen = manager
            .with_lease("memory_42", Duration::from_secs(5), || async {
                manager.is_locked("memory_42").await.unwrap()
            })
            .await
            .unwrap();
        assert!(seen);
        assert!(!manager.is_locked("memory_42").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lease_releases_after_body_error() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);

        let outcome: Result<std::result::Result<(), String>> = manager
            .with_lease("memory_42", Duration::from_secs(5), || async {
                Err("processing failed".to_string())
            })
            .await;
        assert_eq!(outcome.unwrap(), Err("processing failed".to_string()));
        assert!(!manager.is_locked("memory_42").await.unwrap());
    }

    #[tokio::test]
    async fn test_force_release() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);

        assert!(!manager.force_release("memory_42").await.unwrap());

        let other = create_test_manager(&backend);
        let _held = other.lock("memory_42", Duration::from_secs(30)).await.unwrap();
        assert!(manager.force_release("memory_42").await.unwrap());
        assert!(!manager.is_locked("memory_42").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_with_token() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);

        let lease = manager.lock("memory_42", Duration::from_secs(30)).await.unwrap();
        let token = lease.token().unwrap().to_string();
        std::mem::forget(lease);

        let err = manager
            .release_with_token("memory_42", "0b7c3f52-5a1e-4d7c-8a55-0f5a8e3c9d21")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotOwner { .. }));
        assert!(manager.is_locked("memory_42").await.unwrap());

        let err = manager.release_with_token("memory_42", "bogus").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOwnership(_)));
        assert!(manager.is_locked("memory_42").await.unwrap());

        manager.release_with_token("memory_42", &token).await.unwrap();
        assert!(!manager.is_locked("memory_42").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_info() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);
        assert!(manager.lease_info("memory_42").await.unwrap().is_none());

        let _lease = manager.lock("memory_42", Duration::from_secs(20)).await.unwrap();
        let info = manager.lease_info("memory_42").await.unwrap().unwrap();
        assert_eq!(info.key, "audit_lock:memory_42");
        assert_eq!(info.record_id, "memory_42");
        assert_eq!(info.ttl, KeyTtl::Expires(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expires_persistent_and_removes_overlong() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);
        let max_age = Duration::from_secs(60);

        backend.insert_persistent("audit_lock:orphan", "v").await;
        backend
            .insert_with_ttl("audit_lock:young", "v", Duration::from_secs(30))
            .await;
        backend
            .insert_with_ttl("audit_lock:overlong", "v", Duration::from_secs(600))
            .await;
        backend
            .insert_with_ttl("other_ns:overlong", "v", Duration::from_secs(600))
            .await;

        assert_eq!(manager.cleanup_expired_locks(max_age).await, 1);

        let conn = backend.open().await.unwrap();
        assert_eq!(conn.ttl("audit_lock:orphan").await.unwrap(), KeyTtl::Expires(60));
        assert_eq!(conn.ttl("audit_lock:young").await.unwrap(), KeyTtl::Expires(30));
        assert_eq!(conn.ttl("audit_lock:overlong").await.unwrap(), KeyTtl::Missing);
        assert!(conn.exists("other_ns:overlong").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sub_second_max_age_is_one_second() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);

        backend
            .insert_with_ttl("audit_lock:one_second", "v", Duration::from_secs(1))
            .await;
        backend
            .insert_with_ttl("audit_lock:five_seconds", "v", Duration::from_secs(5))
            .await;

        assert_eq!(manager.cleanup_expired_locks(Duration::ZERO).await, 1);
        assert!(manager.is_locked("one_second").await.unwrap());
        assert!(!manager.is_locked("five_seconds").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_swallows_store_errors() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);
        backend
            .insert_with_ttl("audit_lock:overlong", "v", Duration::from_secs(600))
            .await;

        // Unable to connect at all
        backend.set_unreachable(true);
        assert_eq!(manager.cleanup_expired_locks(Duration::from_secs(60)).await, 0);

        // Connected, then the store goes away mid-sweep
        backend.set_unreachable(false);
        manager.connect().await.unwrap();
        backend.set_unreachable(true);
        assert_eq!(manager.cleanup_expired_locks(Duration::from_secs(60)).await, 0);

        backend.set_unreachable(false);
        assert_eq!(manager.cleanup_expired_locks(Duration::from_secs(60)).await, 1);
    }
}
