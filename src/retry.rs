//! Exponential backoff retry policy shared by credential exchange,
//! enumerator paging and inventory submission.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable: std::fmt::Display + Sized {
    fn is_retryable(&self) -> bool;

    /// Server-provided delay, e.g. from a `Retry-After` header.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Wrap the last error once attempts are used up.
    fn exhausted(_attempts: u32, last: Self) -> Self {
        last
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubles on every retry.
    pub base_delay: Duration,
    /// Cap for both computed and server-provided delays.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Three attempts, used for enumerator pages and token endpoints.
    pub fn transient() -> Self {
        Self::new(3, Duration::from_millis(500))
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `attempt` is zero-based: attempt 0 failed, may attempt 1 run?
    pub fn should_retry<E: Retryable>(&self, attempt: u32, error: &E) -> bool {
        attempt + 1 < self.max_attempts && error.is_retryable()
    }

    pub fn delay_for<E: Retryable>(&self, attempt: u32, error: &E) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return retry_after.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails permanently, or attempts run out.
    pub async fn execute<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    if !self.should_retry(attempt, &error) {
                        warn!(
                            operation,
                            attempts = attempt + 1,
                            error = %error,
                            "Retries exhausted"
                        );
                        return Err(E::exhausted(attempt + 1, error));
                    }

                    let delay = self.delay_for(attempt, &error);
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
