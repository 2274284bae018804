//! Atomic compare-and-delete release
//!
//! A lease is released by one server-side script that deletes the key only
//! when its value still equals the caller's owner token. The manager loads
//! the script at connect time and hands the cached handle to every lease;
//! when that handle is missing or the store reports it flushed, the literal
//! script is submitted instead.

use tracing::{debug, error, warn};

use super::types::validate_token;
use crate::error::{Error, Result};
use crate::store::{ScriptHandle, StoreConnection, StoreError};

/// `if GET(key) == token then DEL(key)`; returns 1 when deleted, else 0
pub const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Release `key` if it still holds `token`
///
/// Returns `Ok(true)` when the key was deleted and `Ok(false)` when it was
/// absent or owned by another token. Malformed input fails before any store
/// call. Script and connection failures are logged and propagated; the
/// lease must then be treated as possibly still held.
pub async fn release_atomically(
    conn: &dyn StoreConnection,
    cached: Option<&ScriptHandle>,
    key: &str,
    token: &str,
) -> Result<bool> {
    if key.is_empty() {
        return Err(Error::InvalidKey(
            "lease key must be a non-empty string".to_string(),
        ));
    }
    validate_token(token)?;

    let reply = match cached {
        Some(handle) => match conn.eval_sha(handle, key, token).await {
            Err(StoreError::NoScript) => {
                warn!(lock_key = %key, script = %handle, "Release script not cached; falling back to EVAL");
                conn.eval(RELEASE_SCRIPT, key, token).await
            }
            other => other,
        },
        None => {
            warn!(lock_key = %key, "Release script not loaded; using EVAL");
            conn.eval(RELEASE_SCRIPT, key, token).await
        }
    };

    match reply {
        Ok(1) => {
            debug!(lock_key = %key, "Release script deleted lease");
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(StoreError::Connection(message)) => {
            error!(lock_key = %key, error = %message, "Store connection failed during release");
            Err(Error::Connectivity(message))
        }
        Err(e) => {
            error!(lock_key = %key, error = %e, "Release script failed");
            Err(Error::ScriptExecution {
                key: key.to_string(),
                message: e.to_string(),
            })
        }
    }
}
