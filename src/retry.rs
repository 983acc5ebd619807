//! Retry coordinator with exponential backoff
//!
//! Wraps any fallible async operation with a bounded number of attempts.
//! Between attempts it sleeps for `min(max_delay, base_delay * factor^(attempt-1))`.
//!
//! The policy is blind to the server's `normalizedRetryable` hint: the
//! backoff schedule alone bounds the total wait. Failures that signal a
//! contract break (see [`E2eError::is_retryable`]) end the loop early, and
//! the last failure is always returned unwrapped.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::{E2eError, Result};
use crate::metrics::RETRY_ATTEMPTS;

/// Multiplier applied per attempt
pub const BACKOFF_FACTOR: f64 = 1.3;

/// Ceiling for a single backoff delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            factor: BACKOFF_FACTOR,
            max_delay: MAX_BACKOFF,
        }
    }

    /// Delay to wait after `attempt` failed (attempt numbering starts at 1)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or the policy gives up.
///
/// No state is shared between invocations; each call owns its attempt
/// counter.
///
/// # Errors
///
/// The error of the final attempt, or the first non-retryable error.
pub async fn retry<T, F, Fut>(label: &str, policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts || !err.is_retryable() => return Err(err),
            Err(err) => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation = label,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "{} failed (attempt {}/{})",
                    label,
                    attempt,
                    attempts
                );
                RETRY_ATTEMPTS.with_label_values(&[label]).inc();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Convenience for building an [`E2eError::Unsettled`] inside retried steps
pub fn unsettled(message: impl Into<String>) -> E2eError {
    E2eError::Unsettled(message.into())
}
