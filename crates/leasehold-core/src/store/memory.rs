//! In-process coordination store
//!
//! Every connection opened from one [`MemoryBackend`] shares the same key
//! space, so several `LockManager`s built on a cloned backend contend for
//! leases exactly like separate processes sharing one Redis. Expiry follows
//! `tokio::time`, which lets tests drive TTLs with a paused clock.
//!
//! Only the lease release script is understood by `EVAL`/`EVALSHA`. Fault
//! injection and raw inserts are available under the `test-util` feature.

use super::{KeyTtl, ScriptHandle, StoreBackend, StoreConnection, StoreError, StoreResult};
use crate::locking::script::RELEASE_SCRIPT;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    scripts: HashMap<String, String>,
}

impl State {
    /// Drop the entry if its expiry has passed, then return it
    fn live(&mut self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.is_live(now));
    }

    fn run_script(&mut self, script: &str, key: &str, arg: &str) -> StoreResult<i64> {
        if script.trim() != RELEASE_SCRIPT.trim() {
            return Err(StoreError::Script("unsupported script".to_string()));
        }
        match self.live(key) {
            Some(entry) if entry.value == arg => {
                self.entries.remove(key);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    unreachable: AtomicBool,
    scripts_fail: AtomicBool,
}

/// Shared in-memory store; clones refer to the same key space
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: `open` and every call on existing connections fail
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make every script evaluation fail server-side
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_scripts_fail(&self, fail: bool) {
        self.shared.scripts_fail.store(fail, Ordering::SeqCst);
    }

    /// Equivalent of `SCRIPT FLUSH`
    #[cfg(any(test, feature = "test-util"))]
    pub async fn flush_scripts(&self) {
        self.shared.state.lock().await.scripts.clear();
    }

    /// Write a key with no expiry, bypassing `NX`
    #[cfg(any(test, feature = "test-util"))]
    pub async fn insert_persistent(&self, key: &str, value: &str) {
        self.shared.state.lock().await.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Write a key with an arbitrary expiry, bypassing `NX`
    #[cfg(any(test, feature = "test-util"))]
    pub async fn insert_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        self.shared.state.lock().await.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    /// Current value of a live key
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut state = self.shared.state.lock().await;
        state.live(key).map(|e| e.value.clone())
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let mut state = self.shared.state.lock().await;
        state.purge_expired();
        state.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn open(&self) -> StoreResult<Arc<dyn StoreConnection>> {
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store unreachable".to_string()));
        }
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}

/// A connection into a [`MemoryBackend`]
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection closed".to_string()));
        }
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store unreachable".to_string()));
        }
        Ok(())
    }

    fn check_script(&self) -> StoreResult<()> {
        self.check()?;
        if self.shared.scripts_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Script("injected script failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.shared.state.lock().await;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn script_load(&self, script: &str) -> StoreResult<ScriptHandle> {
        self.check()?;
        let digest = hex::encode(Sha256::digest(script.as_bytes()));
        let mut state = self.shared.state.lock().await;
        state.scripts.insert(digest.clone(), script.to_string());
        Ok(ScriptHandle::new(digest))
    }

    async fn eval_sha(&self, handle: &ScriptHandle, key: &str, arg: &str) -> StoreResult<i64> {
        self.check_script()?;
        let mut state = self.shared.state.lock().await;
        let script = state
            .scripts
            .get(handle.as_str())
            .cloned()
            .ok_or(StoreError::NoScript)?;
        state.run_script(&script, key, arg)
    }

    async fn eval(&self, script: &str, key: &str, arg: &str) -> StoreResult<i64> {
        self.check_script()?;
        let mut state = self.shared.state.lock().await;
        state.run_script(script, key, arg)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.shared.state.lock().await;
        Ok(state.live(key).is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.shared.state.lock().await;
        let existed = state.live(key).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.check()?;
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        Ok(match state.live(key) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                // Round to the nearest second the way Redis reports TTL
                let remaining = at.saturating_duration_since(now);
                KeyTtl::Expires((remaining.as_millis() as u64 + 500) / 1000)
            }
        })
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.shared.state.lock().await;
        if state.live(key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = state.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(secs));
        }
        Ok(true)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let mut state = self.shared.state.lock().await;
        state.purge_expired();
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Minimal `KEYS` glob: `*` and `?`, everything else literal
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}
