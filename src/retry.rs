//! Bounded exponential backoff for upstream calls.
//!
//! Connectors drive [`RetryPolicy`] from their own request loops, where they
//! can tell an expired credential from a flaky network; embedding calls go
//! through [`with_retry`]. Delays double from `base_delay` up to
//! `max_delay`; a server-provided `Retry-After` wins when it is longer.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::KbError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_secs(32),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Backoff for retry `attempt`, stretched to a server-requested wait.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        let delay = self.backoff(attempt);
        match retry_after {
            Some(secs) => delay.max(Duration::from_secs(secs).min(self.max_delay)),
            None => delay,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, KbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KbError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let retry_after = match &err {
                    KbError::RateLimited { retry_after, .. } => *retry_after,
                    _ => None,
                };
                let delay = policy.delay_for(attempt, retry_after);
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
