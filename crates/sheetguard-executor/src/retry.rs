//! Retry with exponential backoff around executor calls.
//!
//! Transient executor failures (rate limiting, unavailability, deadlines)
//! are retried; everything else is returned on the first attempt. Every
//! attempt and every backoff sleep races the caller's cancellation token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sheetguard_common::config::RetryConfig;
use sheetguard_common::error::{ExecResult, ExecutorError, GuardError, GuardResult};

/// Predicate deciding whether an executor error may be retried.
pub type RetryPredicate = fn(&ExecutorError) -> bool;

/// Retry policy for executor calls.
///
/// # Example
///
/// ```rust
/// use sheetguard_executor::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.backoff(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Cap on any single backoff.
    pub max_backoff: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Which errors are retried.
    pub retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Builds a policy from configuration, retrying transient errors.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
            retryable: ExecutorError::is_transient,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Replaces the retryable-error predicate.
    #[must_use]
    pub fn with_predicate(mut self, retryable: RetryPredicate) -> Self {
        self.retryable = retryable;
        self
    }

    /// Backoff to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Returns true if another attempt is allowed after `attempt` failed with `err`.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, err: &ExecutorError) -> bool {
        attempt < self.max_attempts && (self.retryable)(err)
    }

    /// Runs `call` until it succeeds, fails permanently, exhausts the policy
    /// or `cancel` fires.
    ///
    /// `call` receives the 1-based attempt number so callers can look up
    /// an already-applied write before repeating one.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> GuardResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ExecResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(GuardError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GuardError::Cancelled),
                outcome = call(attempt) => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "executor call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if self.should_retry(attempt, &err) => {
                    let delay = self.backoff(attempt);
                    warn!(what, attempt, ?delay, error = %err, "transient executor failure, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GuardError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if (self.retryable)(&err) {
                        warn!(what, attempt, error = %err, "executor retries exhausted");
                    }
                    return Err(err.into());
                }
            }
        }
    }
}
