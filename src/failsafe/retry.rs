//! Retry logic with exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `retries + 1`)
    pub retries: u32,
    /// Delay before the first retry; doubles for every further retry
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
        }
    }

    /// Maximum number of calls the policy allows
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay after the failed attempt with zero-based index `attempt`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }
}

/// `base * 2^attempt`, saturating at [`Duration::MAX`]
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Final failure of a retried operation
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Calls made, including the first
    pub attempts: u32,
    /// Error of the last call
    pub error: E,
}

/// Execute `f` until it succeeds, fails with a non-retryable error, or the
/// policy's budget is spent.
///
/// `f` receives the zero-based attempt index. Between attempts the driver
/// sleeps for [`RetryPolicy::delay_for`] the failed attempt.
///
/// # Errors
///
/// Returns the last error from `f` together with the number of calls made.
pub async fn with_retry<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: R,
    mut f: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    debug!(operation, attempt, error = %e, "Error is not retryable");
                    return Err(Exhausted {
                        attempts: attempt + 1,
                        error: e,
                    });
                }

                if attempt >= policy.retries {
                    debug!(
                        operation,
                        attempts = attempt + 1,
                        "Max retry attempts reached"
                    );
                    return Err(Exhausted {
                        attempts: attempt + 1,
                        error: e,
                    });
                }

                let delay = policy.delay_for(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
