//! Bounded retry for outbound model calls.
//!
//! Every embedding and language-model request gets at most one retry, and
//! only when the first failure is classified transient
//! ([`Error::is_transient`]). Permanent failures propagate immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Run `call`, retrying exactly once after `backoff` on a transient error.
pub async fn retry_once<T, F, Fut>(operation: &str, backoff: Duration, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            warn!(
                operation,
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "transient failure, retrying once"
            );
            tokio::time::sleep(backoff).await;
            call().await
        }
        Err(err) => Err(err),
    }
}

/// Wrap a future in a hard deadline, mapping expiry to a transient error.
pub async fn with_timeout<T, Fut>(operation: &str, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::transient(format!(
            "{} timed out after {}s",
            operation,
            limit.as_secs_f32()
        ))),
    }
}
