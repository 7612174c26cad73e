//! Bounded exponential backoff for lock contention.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{CoreError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Backoff schedule used while a state lock is held elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub factor: u32,
    /// Total wait before giving up with `LockTimeout`.
    pub timeout: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            factor: 2,
            timeout: Duration::from_secs(300),
        }
    }
}

impl LockRetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fail on the first contention.
    pub fn no_wait() -> Self {
        Self::default().with_timeout(Duration::ZERO)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds or fails with a non-retryable error.
///
/// Retryable errors (`CoreError::LockUnavailable`) sleep with exponential
/// backoff; once `policy.timeout` has elapsed the last contention becomes
/// `CoreError::LockTimeout`.
pub async fn retry_on_lock<T, F, Fut>(
    environment: &str,
    policy: &LockRetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut backoff = policy.initial_backoff;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(err) if err.is_retryable() => {
                let elapsed = start.elapsed();
                if elapsed >= policy.timeout {
                    return Err(CoreError::LockTimeout {
                        environment: environment.to_string(),
                        waited_secs: elapsed.as_secs(),
                    });
                }
                let sleep = backoff.min(policy.timeout - elapsed);
                METRICS.inc_lock_retries();
                obs::emit_lock_wait(environment, attempt, sleep.as_millis() as u64);
                tokio::time::sleep(sleep).await;
                backoff = policy.next_backoff(backoff);
            }
            other => return other,
        }
    }
}
