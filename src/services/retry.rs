use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};

/// Errors that a [`RetryPolicy`] knows how to classify.
pub trait Retryable {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;

    /// Error to report when a single attempt exceeded its deadline.
    fn timed_out(after: Duration) -> Self;
}

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `[0, 1]`; each delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// No waiting between attempts.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0.0)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^20 * base already exceeds any sane cap
        let exponent = attempt.min(20);
        let raw = self.base.saturating_mul(2u32.saturating_pow(exponent));
        let capped = raw.min(self.max);

        if self.jitter == 0.0 || capped.is_zero() {
            return capped;
        }

        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        capped.mul_f64(factor).min(self.max)
    }
}

/// Bounded retry loop applied to every call that leaves the process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            attempt_timeout,
        }
    }

    /// A single attempt, still bounded by `attempt_timeout`.
    pub fn once(attempt_timeout: Duration) -> Self {
        Self::new(1, Backoff::none(), attempt_timeout)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match timeout(self.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.attempt_timeout)),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(
                            operation,
                            attempt,
                            error = %e,
                            "Retry budget exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}
