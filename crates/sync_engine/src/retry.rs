use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sync_logging::sync_warn;

use crate::rate_limit::RateLimiter;
use crate::types::{Disposition, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub backoff_ms: u64,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_ms: 1_000,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Run `request` under the rate limiter, retrying transient failures with a
/// fixed backoff. Each attempt takes its own permit.
pub async fn fetch_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    limiter: &dyn RateLimiter,
    what: &str,
    mut request: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        limiter.acquire().await;
        let err = match request().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.disposition() == Disposition::Propagate || attempt >= max_attempts {
            return Err(err);
        }
        sync_warn!(
            "{} failed (attempt {}/{}), retrying in {:?}: {}",
            what,
            attempt,
            max_attempts,
            policy.backoff(),
            err
        );
        tokio::time::sleep(policy.backoff()).await;
        attempt += 1;
    }
}
