//! Resilient request executor: retry with backoff behind a circuit breaker.
//!
//! ```text
//! execute(call)
//!   ├─ breaker.can_execute()? ── no ──▶ ExecutorError::CircuitOpen
//!   └─ loop attempt in 0..=max_retries
//!        ├─ Ok            ──▶ record_success, return
//!        ├─ 4xx (≠ 429)   ──▶ record_failure, ExecutorError::Rejected
//!        ├─ 429           ──▶ sleep Retry-After (or policy delay), retry
//!        └─ transient     ──▶ sleep policy delay, retry
//!   exhausted ──▶ record_failure (unless last error was 429), RetriesExhausted
//! ```
//!
//! A call that ends rate limited or cancelled records no outcome and hands
//! its `HALF_OPEN` test slot back to the breaker. Server wait hints are
//! capped at the policy's `max_delay`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::retry::{ErrorCategory, RetryPolicy, categorize_status};
use crate::infrastructure::metrics;

/// Failure of a single outbound attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The attempt did not finish within the call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure (connect, reset, DNS).
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server wait hint from `Retry-After`.
        retry_after: Option<Duration>,
        /// Response body or reason.
        message: String,
    },

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl CallError {
    /// Retry category for this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) | Self::Connection(_) => ErrorCategory::Retryable,
            Self::Status { status, .. } => categorize_status(*status),
            Self::Decode(_) => ErrorCategory::NonRetryable,
        }
    }

    /// Server-provided wait hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Error returned by [`ResilientExecutor::execute`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The breaker refused the call; no I/O was attempted.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Breaker name.
        name: String,
    },

    /// A definitive client error; not retried.
    #[error("request rejected: {0}")]
    Rejected(CallError),

    /// Every permitted attempt failed.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: CallError,
    },

    /// Shutdown was requested while waiting to retry.
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Whether the breaker rejected the call without attempting it.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Underlying call error, if one was observed.
    #[must_use]
    pub const fn call_error(&self) -> Option<&CallError> {
        match self {
            Self::Rejected(e) | Self::RetriesExhausted { last: e, .. } => Some(e),
            Self::CircuitOpen { .. } | Self::Cancelled => None,
        }
    }
}

/// Wraps single outbound calls with retry and circuit breaking.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ResilientExecutor {
    /// Create an executor with its own breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, policy: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            policy,
            breaker: Arc::new(CircuitBreaker::new(name, breaker)),
            call_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound each attempt by `timeout`.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Abort pending backoff sleeps when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The breaker guarding this executor.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` with retry and circuit breaking.
    ///
    /// # Errors
    ///
    /// - [`ExecutorError::CircuitOpen`] if the breaker rejects the call
    /// - [`ExecutorError::Rejected`] on a non-retryable failure
    /// - [`ExecutorError::RetriesExhausted`] when every attempt failed
    /// - [`ExecutorError::Cancelled`] if shutdown interrupts a backoff sleep
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T, ExecutorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let name = self.breaker.name();
        if !self.breaker.can_execute() {
            tracing::debug!(name = %name, "Call rejected by open circuit");
            return Err(ExecutorError::CircuitOpen {
                name: name.to_string(),
            });
        }

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            let error = match self.attempt(&mut call).await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) => e,
            };
            attempt += 1;

            let category = error.category();
            if category == ErrorCategory::NonRetryable {
                tracing::warn!(name = %name, error = %error, "Non-retryable error");
                self.breaker.record_failure();
                return Err(ExecutorError::Rejected(error));
            }

            if attempt >= max_attempts {
                tracing::warn!(name = %name, error = %error, attempts = attempt, "Retries exhausted");
                if category == ErrorCategory::RateLimited {
                    self.breaker.release_half_open_call();
                } else {
                    self.breaker.record_failure();
                }
                return Err(ExecutorError::RetriesExhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = match category {
                ErrorCategory::RateLimited => error.retry_after().map_or_else(
                    || self.policy.delay_for(attempt - 1),
                    |hint| hint.min(self.policy.max_delay),
                ),
                _ => self.policy.delay_for(attempt - 1),
            };

            metrics::record_executor_retry(name, category);
            tracing::warn!(
                name = %name,
                error = %error,
                delay_ms = delay.as_millis(),
                attempt,
                "Call failed, retrying"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.breaker.release_half_open_call();
                    return Err(ExecutorError::Cancelled);
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, call: &mut F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call())
                .await
                .unwrap_or(Err(CallError::Timeout(limit))),
            None => call().await,
        }
    }
}
