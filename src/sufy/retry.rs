//! Opt-in retry for classified transient failures
//!
//! Nothing in the client retries on its own. Wrap an operation in
//! [`RetryPolicy::run`] to retry `SlowDown` and 5xx responses with
//! exponential backoff plus jitter. Every other error is returned at once.

use crate::sufy::error::Result;
use std::future::Future;
use std::time::Duration;

/// Pseudo-random jitter in 0.0 - 1.0 from the clock's sub-second nanos
fn rand_jitter() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Backoff before retry number `attempt` (0-based), up to 20% jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        base + base.mul_f64(0.2 * rand_jitter())
    }

    /// Run `op`, retrying while it fails with a retryable error
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
