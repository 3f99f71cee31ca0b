//! Retry with classification and exponential backoff.
//!
//! Both background workers retry remote calls the same way: run the
//! operation, ask a predicate whether the failure is worth another attempt,
//! and sleep `base_delay * 2^(retry - 1)` (capped at `max_delay`) before
//! trying again. Sleeps observe a [`CancellationToken`] so shutdown never
//! waits out a backoff.

use std::future::Future;
use std::time::Duration;

use bridge_traits::error::BridgeError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry ceiling and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500)).with_max_delay(Duration::from_secs(10))
    }
}

/// Why a retried operation gave up.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The operation failed with an error the predicate rejected.
    #[error("{0}")]
    NonRetryable(E),

    /// Cancellation was requested before the operation succeeded.
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if the operation ever produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::NonRetryable(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, exhausts the
/// policy, or `cancel` fires.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: P,
    mut op: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&err) {
            return Err(RetryError::NonRetryable(err));
        }

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable failure, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

/// Bound a remote call by `limit`, mapping the elapsed case to
/// [`BridgeError::Timeout`].
pub async fn with_timeout<T, Fut>(
    limit: Duration,
    operation: &str,
    fut: Fut,
) -> std::result::Result<T, BridgeError>
where
    Fut: Future<Output = std::result::Result<T, BridgeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout(format!(
            "{} exceeded {}s",
            operation,
            limit.as_secs()
        ))),
    }
}
