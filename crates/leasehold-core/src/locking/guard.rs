//! Lease handles with scoped release
//!
//! A [`LeaseHandle`] represents one acquisition attempt on one key. It is
//! created unentered by `LockManager::acquire`; `enter` performs the
//! conditional set, `release` the atomic compare-and-delete.
//!
//! Release happens on every exit path. Callers awaiting `release` (or using
//! `LockManager::with_lease`) observe its outcome; a handle dropped while
//! it may own the key (panic, cancelled future, early `?` return) schedules
//! the same atomic release on the current tokio runtime. A scheduled release
//! is not yet visible when the drop returns.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::script::release_atomically;
use super::types::{LeaseKey, LeaseState, OwnerToken};
use crate::error::{Error, Result};
use crate::store::{ScriptHandle, StoreConnection};

/// One acquisition of one lease
pub struct LeaseHandle {
    conn: Arc<dyn StoreConnection>,
    script: Option<ScriptHandle>,
    key: LeaseKey,
    ttl: Duration,
    state: LeaseState,

    /// Set from just before the conditional set until the key is known to
    /// be released or never written by us
    token: Option<OwnerToken>,

    acquired_at: Option<Instant>,
}

impl LeaseHandle {
    pub(crate) fn new(
        conn: Arc<dyn StoreConnection>,
        script: Option<ScriptHandle>,
        key: LeaseKey,
        ttl: Duration,
    ) -> Self {
        Self {
            conn,
            script,
            key,
            ttl,
            state: LeaseState::Unentered,
            token: None,
            acquired_at: None,
        }
    }

    /// The store key this handle targets
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// Store-side expiry applied at entry
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == LeaseState::Held
    }

    /// Owner token, present only while held
    pub fn token(&self) -> Option<&OwnerToken> {
        match self.state {
            LeaseState::Held => self.token.as_ref(),
            _ => None,
        }
    }

    /// Time since the lease was acquired
    pub fn held_for(&self) -> Option<Duration> {
        self.acquired_at.map(|at| at.elapsed())
    }

    /// Acquire the lease: `SET key token NX PX ttl`
    ///
    /// Contention fails fast with `Error::LeaseUnavailable`; there is no
    /// waiting. A handle can be entered once.
    pub async fn enter(&mut self) -> Result<()> {
        if self.state != LeaseState::Unentered {
            return Err(Error::InvalidState(format!(
                "lease handle for '{}' is {}, not unentered",
                self.key, self.state
            )));
        }

        let token = OwnerToken::generate();
        self.token = Some(token.clone());

        match self.conn.set_if_absent(&self.key, &token, self.ttl).await {
            Ok(true) => {
                self.state = LeaseState::Held;
                self.acquired_at = Some(Instant::now());
                debug!(lock_key = %self.key, ttl_ms = self.ttl.as_millis() as u64, "Lease acquired");
                Ok(())
            }
            Ok(false) => {
                self.token = None;
                self.state = LeaseState::FailedToAcquire;
                debug!(lock_key = %self.key, "Lease unavailable");
                Err(Error::LeaseUnavailable {
                    key: self.key.to_string(),
                })
            }
            Err(e) => {
                // The write may have landed; the token stays so drop can clean up.
                self.state = LeaseState::FailedToAcquire;
                Err(Error::from_store(e))
            }
        }
    }

    /// Release the lease if held; a no-op in any other state
    ///
    /// Returns `Error::NotOwner` when the key had already expired or been
    /// taken over. On `ScriptExecution` or `Connectivity` errors the handle
    /// stays held and may be released again.
    pub async fn release(&mut self) -> Result<()> {
        if self.state != LeaseState::Held {
            return Ok(());
        }
        let Some(token) = self.token.clone() else {
            return Ok(());
        };

        let deleted =
            release_atomically(self.conn.as_ref(), self.script.as_ref(), &self.key, &token).await?;

        self.token = None;
        self.state = LeaseState::Released;
        let held_ms = self.held_for().map(|d| d.as_millis() as u64).unwrap_or(0);

        if deleted {
            debug!(lock_key = %self.key, held_ms, "Lease released");
            Ok(())
        } else {
            warn!(lock_key = %self.key, held_ms, "Lease was no longer ours at release (may have expired)");
            Err(Error::NotOwner {
                key: self.key.to_string(),
            })
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let was_held = self.state == LeaseState::Held;
        self.state = LeaseState::Released;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock_key = %self.key, "No async runtime at drop; lease left to expire");
            return;
        };

        let conn = self.conn.clone();
        let script = self.script.clone();
        let key = self.key.clone();
        runtime.spawn(async move {
            match release_atomically(conn.as_ref(), script.as_ref(), &key, &token).await {
                Ok(true) => debug!(lock_key = %key, "Lease released on drop"),
                Ok(false) if was_held => {
                    warn!(lock_key = %key, "Lease was no longer ours at drop (may have expired)")
                }
                Ok(false) => {}
                Err(e) if was_held => error!(lock_key = %key, error = %e, "Release on drop failed"),
                Err(e) => debug!(lock_key = %key, error = %e, "Cleanup of unconfirmed acquire failed"),
            }
        });
    }
}

impl fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lease[{}]", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::script::RELEASE_SCRIPT;
    use crate::locking::types::build_key;
    use crate::store::{MemoryBackend, StoreBackend};

    async fn handle(backend: &MemoryBackend, record: &str, ttl: Duration) -> LeaseHandle {
        let conn = backend.open().await.unwrap();
        let script = conn.script_load(RELEASE_SCRIPT).await.ok();
        LeaseHandle::new(conn, script, build_key(record).unwrap(), ttl)
    }

    /// Let spawned drop-releases run
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_enter_and_release() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_1", Duration::from_secs(5)).await;
        assert_eq!(lease.state(), LeaseState::Unentered);
        assert!(lease.token().is_none());

        lease.enter().await.unwrap();
        assert!(lease.is_held());
        let token = lease.token().unwrap().to_string();
        assert_eq!(backend.get("audit_lock:memory_1").await, Some(token));

        lease.release().await.unwrap();
        assert_eq!(lease.state(), LeaseState::Released);
        assert!(lease.token().is_none());
        assert!(backend.get("audit_lock:memory_1").await.is_none());
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_2", Duration::from_secs(5)).await;
        lease.enter().await.unwrap();

        lease.release().await.unwrap();
        lease.release().await.unwrap();
        assert_eq!(lease.state(), LeaseState::Released);
    }

    #[tokio::test]
    async fn test_release_before_enter_is_noop() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_3", Duration::from_secs(5)).await;
        lease.release().await.unwrap();
        assert_eq!(lease.state(), LeaseState::Unentered);
    }

    #[tokio::test]
    async fn test_contention_fails_fast() {
        let backend = MemoryBackend::new();
        let mut first = handle(&backend, "memory_4", Duration::from_secs(5)).await;
        let mut second = handle(&backend, "memory_4", Duration::from_secs(5)).await;

        first.enter().await.unwrap();
        let err = second.enter().await.unwrap_err();
        assert!(err.is_contention());
        assert_eq!(second.state(), LeaseState::FailedToAcquire);

        // A failed handle must not disturb the holder when dropped.
        drop(second);
        settle().await;
        assert!(first.is_held());
        assert_eq!(
            backend.get("audit_lock:memory_4").await.as_deref(),
            first.token().map(|t| t.as_str())
        );
    }

    #[tokio::test]
    async fn test_enter_twice_is_rejected() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_5", Duration::from_secs(5)).await;
        lease.enter().await.unwrap();

        let err = lease.enter().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(lease.is_held());
    }

    #[tokio::test]
    async fn test_drop_releases_held_lease() {
        let backend = MemoryBackend::new();
        {
            let mut lease = handle(&backend, "memory_6", Duration::from_secs(30)).await;
            lease.enter().await.unwrap();
        }
        settle().await;
        assert!(backend.get("audit_lock:memory_6").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_expiry_reports_not_owner() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_7", Duration::from_secs(1)).await;
        lease.enter().await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let mut thief = handle(&backend, "memory_7", Duration::from_secs(30)).await;
        thief.enter().await.unwrap();

        let err = lease.release().await.unwrap_err();
        assert!(matches!(err, Error::NotOwner { .. }));
        assert_eq!(lease.state(), LeaseState::Released);
        assert!(thief.is_held());
        assert!(backend.get("audit_lock:memory_7").await.is_some());
    }

    #[tokio::test]
    async fn test_script_error_keeps_lease_held() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_8", Duration::from_secs(30)).await;
        lease.enter().await.unwrap();

        backend.set_scripts_fail(true);
        let err = lease.release().await.unwrap_err();
        assert!(matches!(err, Error::ScriptExecution { .. }));
        assert!(lease.is_held());
        assert!(backend.get("audit_lock:memory_8").await.is_some());

        backend.set_scripts_fail(false);
        lease.release().await.unwrap();
        assert!(backend.get("audit_lock:memory_8").await.is_none());
    }

    #[tokio::test]
    async fn test_connection_failure_on_enter() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_9", Duration::from_secs(5)).await;

        backend.set_unreachable(true);
        let err = lease.enter().await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
        assert_eq!(lease.state(), LeaseState::FailedToAcquire);
    }

    /// How `FlakyConnection::set_if_absent` misbehaves after writing
    #[derive(Clone, Copy)]
    enum AfterWrite {
        /// Report a connection reset as if the reply was lost
        Reset,
        /// Never reply
        Hang,
    }

    /// Performs the conditional set, then loses the reply
    struct FlakyConnection {
        inner: Arc<dyn StoreConnection>,
        after_write: AfterWrite,
    }

    #[async_trait::async_trait]
    impl StoreConnection for FlakyConnection {
        async fn ping(&self) -> crate::store::StoreResult<()> {
            self.inner.ping().await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> crate::store::StoreResult<bool> {
            self.inner.set_if_absent(key, value, ttl).await?;
            match self.after_write {
                AfterWrite::Reset => Err(crate::store::StoreError::Connection(
                    "reset after write".to_string(),
                )),
                AfterWrite::Hang => std::future::pending().await,
            }
        }

        async fn script_load(&self, script: &str) -> crate::store::StoreResult<ScriptHandle> {
            self.inner.script_load(script).await
        }

        async fn eval_sha(
            &self,
            handle: &ScriptHandle,
            key: &str,
            arg: &str,
        ) -> crate::store::StoreResult<i64> {
            self.inner.eval_sha(handle, key, arg).await
        }

        async fn eval(&self, script: &str, key: &str, arg: &str) -> crate::store::StoreResult<i64> {
            self.inner.eval(script, key, arg).await
        }

        async fn exists(&self, key: &str) -> crate::store::StoreResult<bool> {
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> crate::store::StoreResult<bool> {
            self.inner.delete(key).await
        }

        async fn ttl(&self, key: &str) -> crate::store::StoreResult<crate::store::KeyTtl> {
            self.inner.ttl(key).await
        }

        async fn expire(&self, key: &str, secs: u64) -> crate::store::StoreResult<bool> {
            self.inner.expire(key, secs).await
        }

        async fn keys(&self, pattern: &str) -> crate::store::StoreResult<Vec<String>> {
            self.inner.keys(pattern).await
        }
    }

    async fn flaky_handle(backend: &MemoryBackend, record: &str, after_write: AfterWrite) -> LeaseHandle {
        let inner = backend.open().await.unwrap();
        let script = inner.script_load(RELEASE_SCRIPT).await.ok();
        let conn: Arc<dyn StoreConnection> = Arc::new(FlakyConnection { inner, after_write });
        LeaseHandle::new(conn, script, build_key(record).unwrap(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_unconfirmed_acquire_is_cleaned_up_on_drop() {
        let backend = MemoryBackend::new();
        let mut lease = flaky_handle(&backend, "memory_11", AfterWrite::Reset).await;

        let err = lease.enter().await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
        assert_eq!(lease.state(), LeaseState::FailedToAcquire);
        assert!(lease.token().is_none());
        // The write landed even though the reply was lost.
        assert!(backend.get("audit_lock:memory_11").await.is_some());

        drop(lease);
        settle().await;
        assert!(backend.get("audit_lock:memory_11").await.is_none());
    }

    #[tokio::test]
    async fn test_unconfirmed_acquire_cleanup_spares_other_owner() {
        let backend = MemoryBackend::new();
        let mut lease = flaky_handle(&backend, "memory_12", AfterWrite::Reset).await;
        lease.enter().await.unwrap_err();

        // Our key expires and someone else takes the record before the drop.
        backend
            .insert_with_ttl("audit_lock:memory_12", "someone-else", Duration::from_secs(30))
            .await;

        drop(lease);
        settle().await;
        assert_eq!(
            backend.get("audit_lock:memory_12").await.as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_cancelled_mid_call_leaves_no_lease() {
        let backend = MemoryBackend::new();
        let mut lease = flaky_handle(&backend, "memory_13", AfterWrite::Hang).await;

        let cancelled = tokio::time::timeout(Duration::from_secs(1), lease.enter()).await;
        assert!(cancelled.is_err());
        assert!(backend.get("audit_lock:memory_13").await.is_some());

        drop(lease);
        settle().await;
        assert!(backend.get("audit_lock:memory_13").await.is_none());
    }

    #[tokio::test]
    async fn test_display_and_debug_hide_token() {
        let backend = MemoryBackend::new();
        let mut lease = handle(&backend, "memory_10", Duration::from_secs(5)).await;
        lease.enter().await.unwrap();
        let token = lease.token().unwrap().to_string();

        assert_eq!(lease.to_string(), "Lease[audit_lock:memory_10]");
        assert!(!format!("{:?}", lease).contains(&token));
    }
}
