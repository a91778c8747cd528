//! Capped exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::StoreError;

/// Backoff policy: `base * 2^attempt`, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Give up after this many retries; `None` retries until shutdown.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap)
    }
}

/// Run `operation`, retrying transient store errors with capped backoff.
///
/// Fatal and conflict errors return immediately; shutdown interrupts the
/// backoff sleep and returns the last error.
pub(crate) async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(error);
                }
                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(
                    error = %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient store failure; backing off"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(error),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Err(error),
        }
    }
}
