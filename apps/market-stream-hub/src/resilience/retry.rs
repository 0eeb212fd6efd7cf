//! Retry policy with exponential backoff for outbound REST calls.
//!
//! # Retryable Errors
//!
//! | Retryable | Rate Limited | Non-Retryable |
//! |-----------|--------------|---------------|
//! | HTTP 5xx | HTTP 429 (honors `Retry-After`) | HTTP 4xx other than 429 |
//! | Call timeouts | | Undecodable response body |
//! | Connection errors | | |
//!
//! The delay for attempt `n` (zero-based) is
//! `min(base_delay * exponential_base^n, max_delay)`, optionally jittered
//! by ±25% and clamped back to `max_delay`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Jitter applied around the base delay when enabled.
pub const JITTER_FACTOR: f64 = 0.25;

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub exponential_base: f64,
    /// Randomize delays by ±25%.
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with custom settings.
    #[must_use]
    pub const fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
        jitter_enabled: bool,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            exponential_base,
            jitter_enabled,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
            jitter_enabled: false,
        }
    }

    /// Total attempts including the first one.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay for `attempt` before jitter, clamped to `max_delay`.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.exponential_base.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let secs = self.base_delay.as_secs_f64() * multiplier;

        if !secs.is_finite() || secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay to sleep before retry number `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if !self.jitter_enabled || base.is_zero() {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let spread = base_secs * JITTER_FACTOR;
        let jittered = rand::rng().random_range((base_secs - spread)..=(base_secs + spread));
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max_delay)
    }
}

/// Error categories for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient failure, retry with backoff.
    Retryable,
    /// Permanent failure, fail fast.
    NonRetryable,
    /// Rate limited, wait for the server hint.
    RateLimited,
}

impl ErrorCategory {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::NonRetryable => "non_retryable",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Categorize an HTTP response status for a retry decision.
#[must_use]
pub const fn categorize_status(status_code: u16) -> ErrorCategory {
    match status_code {
        429 => ErrorCategory::RateLimited,
        408 | 500..=599 => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

/// Parse a `Retry-After` header value.
///
/// Accepts delta-seconds (`"120"`) or an HTTP date
/// (`"Wed, 21 Oct 2015 07:28:00 GMT"`). A date in the past yields zero.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    parse_retry_after_at(value, Utc::now())
}

/// Parse a `Retry-After` value relative to `now`.
#[must_use]
pub fn parse_retry_after_at(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
