//! Redis coordination store driver

use super::{KeyTtl, ScriptHandle, StoreBackend, StoreConnection, StoreError, StoreResult};
use ::redis::aio::ConnectionManager;
use ::redis::{Client, ErrorKind, RedisError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.kind() == ErrorKind::NoScriptError {
            Self::NoScript
        } else if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || err.kind() == ErrorKind::AuthenticationFailed
        {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Map a failure of EVAL/EVALSHA, where server-side errors are script errors
fn script_error(err: RedisError) -> StoreError {
    match StoreError::from(err) {
        StoreError::Command(message) => StoreError::Script(message),
        other => other,
    }
}

/// Opens Redis connections from a `redis://` or `rediss://` URL
#[derive(Debug, Clone)]
pub struct RedisBackend {
    url: String,
}

impl RedisBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn open(&self) -> StoreResult<Arc<dyn StoreConnection>> {
        let client = Client::open(self.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!(endpoint = %self.endpoint(), "Opened Redis connection");
        Ok(Arc::new(RedisConnection { manager }))
    }

    fn endpoint(&self) -> String {
        redact_url(&self.url)
    }
}

/// A multiplexed Redis connection; clones share one socket
#[derive(Clone)]
pub struct RedisConnection {
    manager: ConnectionManager,
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn script_load(&self, script: &str) -> StoreResult<ScriptHandle> {
        let mut conn = self.manager.clone();
        let sha: String = ::redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script)
            .query_async(&mut conn)
            .await?;
        Ok(ScriptHandle::new(sha))
    }

    async fn eval_sha(&self, handle: &ScriptHandle, key: &str, arg: &str) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        ::redis::cmd("EVALSHA")
            .arg(handle.as_str())
            .arg(1)
            .arg(key)
            .arg(arg)
            .query_async(&mut conn)
            .await
            .map_err(script_error)
    }

    async fn eval(&self, script: &str, key: &str, arg: &str) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        ::redis::cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(key)
            .arg(arg)
            .query_async(&mut conn)
            .await
            .map_err(script_error)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let count: i64 = ::redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.manager.clone();
        let reply: i64 = ::redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(KeyTtl::from_reply(reply))
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let applied: i64 = ::redis::cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = ::redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }
}

/// Hide the password component of a store URL
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split_once(':').map(|(u, _)| u).unwrap_or("");
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => url.to_string(),
    }
}
