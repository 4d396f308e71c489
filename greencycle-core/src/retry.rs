//! Retry with exponential backoff.
//!
//! One contract for every call site: the reconnect loop of the push
//! client and the status fetch of the API client both go through
//! [`retry_with_backoff_if`] and stop early on errors that cannot clear
//! by themselves.
//!
//! ```text
//! attempt:   0      1      2      3      4 ...
//! delay:     -    base   2·base 4·base  ... ≤ max_delay
//! ```

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or `policy.max_attempts` is used up.
///
/// The closure receives the 0-based attempt number. The last error is
/// returned when every attempt failed.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(policy, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but stops at the first error for which
/// `should_retry` returns `false` and returns it.
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => {
                log::debug!("Attempt {} failed permanently: {e}", attempt + 1);
                return Err(e);
            }
            Err(e) if attempt + 1 >= attempts => {
                log::warn!("Giving up after {attempts} attempts: {e}");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                log::debug!("Attempt {} failed ({e}), retrying in {delay:?}", attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
