//! Periodic cleanup of abandoned leases
//!
//! The manager never sweeps on its own. A host that wants periodic cleanup
//! runs a [`Reaper`], which calls `cleanup_expired_locks` on a fixed
//! interval until its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::manager::LockManager;
use crate::error::{Error, Result};

/// Interval-driven lease sweeper
#[derive(Debug, Clone)]
pub struct Reaper {
    manager: Arc<LockManager>,
    interval: Duration,
    max_age: Duration,
}

impl Reaper {
    pub fn new(manager: Arc<LockManager>, interval: Duration, max_age: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::Config("reaper interval must be non-zero".to_string()));
        }
        if max_age.as_secs() == 0 {
            return Err(Error::Config("reaper max age must be at least 1s".to_string()));
        }
        Ok(Self {
            manager,
            interval,
            max_age,
        })
    }

    /// Reaper using the manager's configured cleanup age as both bound and interval
    pub fn with_defaults(manager: Arc<LockManager>) -> Result<Self> {
        let max_age = manager.config().cleanup_max_age;
        Self::new(manager, max_age, max_age)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Sweep immediately, then every `interval`, until cancelled
    ///
    /// Returns the total number of leases removed.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "Reaper started"
        );

        let mut total = 0;
        let mut sweeps = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let cleaned = self.manager.cleanup_expired_locks(self.max_age).await;
                    sweeps += 1;
                    total += cleaned;
                    debug!(sweeps, cleaned, "Reaper sweep finished");
                }
            }
        }

        info!(sweeps, total, "Reaper stopped");
        total
    }

    /// Run on the current runtime
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::store::MemoryBackend;

    fn create_test_manager(backend: &MemoryBackend) -> Arc<LockManager> {
        Arc::new(LockManager::new(LeaseConfig::default(), Arc::new(backend.clone())).unwrap())
    }

    #[test]
    fn test_rejects_zero_interval() {
        let manager = create_test_manager(&MemoryBackend::new());
        assert!(Reaper::new(manager.clone(), Duration::ZERO, Duration::from_secs(60)).is_err());
        assert!(Reaper::new(manager, Duration::from_secs(1), Duration::ZERO).is_err());
    }

    #[test]
    fn test_defaults_follow_config() {
        let manager = create_test_manager(&MemoryBackend::new());
        let reaper = Reaper::with_defaults(manager).unwrap();
        assert_eq!(reaper.interval(), Duration::from_secs(60));
        assert_eq!(reaper.max_age(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_sweeps_until_cancelled() {
        let backend = MemoryBackend::new();
        let manager = create_test_manager(&backend);
        let reaper = Reaper::new(manager, Duration::from_secs(10), Duration::from_secs(60)).unwrap();

        backend
            .insert_with_ttl("audit_lock:first", "v", Duration::from_secs(600))
            .await;

        let cancel = CancellationToken::new();
        let task = reaper.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.get("audit_lock:first").await.is_none());

        backend
            .insert_with_ttl("audit_lock:second", "v", Duration::from_secs(600))
            .await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(backend.get("audit_lock:second").await.is_none());

        cancel.cancel();
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_reaper_stops_immediately() {
        let reaper = Reaper::new(
            create_test_manager(&MemoryBackend::new()),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(reaper.run(cancel).await, 0);
    }
}
