//! Circuit breaker for outbound calls to fragile upstreams.
//!
//! Stops issuing calls to a failing dependency until it has had time to
//! recover, so a degraded REST endpoint does not drag the rest of the
//! process down with it.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN       (consecutive failures >= failure_threshold)
//! OPEN → HALF_OPEN    (recovery_timeout elapsed since last failure)
//! HALF_OPEN → CLOSED  (a test call succeeds)
//! HALF_OPEN → OPEN    (a test call fails)
//! ```
//!
//! | State | `can_execute()` | On success | On failure |
//! |-------|-----------------|------------|------------|
//! | CLOSED | true | failure count reset | count++, open at threshold |
//! | OPEN | true once recovery timeout elapsed (moves to HALF_OPEN) | - | refresh last failure |
//! | HALF_OPEN | true while test calls remain | close, reset counters | reopen |
//!
//! Time is read from [`tokio::time::Instant`] so tests can drive the
//! recovery timeout with a paused clock.
//!
//! # Example
//!
//! ```rust,ignore
//! use market_stream_hub::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("binance-rest", CircuitBreakerConfig::default());
//!
//! if breaker.can_execute() {
//!     match fetch().await {
//!         Ok(_) => breaker.record_success(),
//!         Err(_) => breaker.record_failure(),
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::infrastructure::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A limited number of test calls are let through.
    HalfOpen,
}

impl CircuitBreakerState {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time to stay `OPEN` after the last failure.
    pub recovery_timeout: Duration,
    /// Test calls permitted while `HALF_OPEN`.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration.
    #[must_use]
    pub const fn new(
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_calls: u32,
    ) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
        }
    }
}

/// Mutable breaker state, always updated as one unit.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_calls_used: u32,
}

/// Circuit breaker guarding one logical call target.
///
/// Safe to share between tasks: every transition happens under a single
/// mutex so concurrent callers observe a consistent state.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the `CLOSED` state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
                half_open_calls_used: 0,
            }),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Target name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without triggering any time-based transition.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Consecutive failures recorded while `CLOSED`.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Ask whether a call may proceed.
    ///
    /// An `OPEN` breaker whose recovery timeout has elapsed moves to
    /// `HALF_OPEN` and permits the call. Each permitted `HALF_OPEN` call
    /// consumes one test slot.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();

        let permitted = match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                let recovered = inner
                    .last_failure_time
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    self.transition(&mut inner, CircuitBreakerState::HalfOpen);
                    inner.half_open_calls_used = 1;
                }
                recovered
            }
            CircuitBreakerState::HalfOpen => {
                if inner.half_open_calls_used < self.config.half_open_max_calls {
                    inner.half_open_calls_used += 1;
                    true
                } else {
                    false
                }
            }
        };
        drop(inner);

        if !permitted {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::record_circuit_rejection(&self.name);
        }
        permitted
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitBreakerState::Closed => inner.failure_count = 0,
            CircuitBreakerState::HalfOpen => {
                self.transition(&mut inner, CircuitBreakerState::Closed);
            }
            CircuitBreakerState::Open => {
                tracing::debug!(name = %self.name, "Success recorded while circuit is OPEN");
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Hand back a `HALF_OPEN` test slot taken by a call that ended with
    /// neither a success nor a failure (rate limited or cancelled).
    ///
    /// No effect in any other state.
    pub fn release_half_open_call(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitBreakerState::HalfOpen {
            inner.half_open_calls_used = inner.half_open_calls_used.saturating_sub(1);
        }
    }

    /// Apply a state change and reset the counters it implies.
    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitBreakerState::Closed => {
                inner.failure_count = 0;
                inner.half_open_calls_used = 0;
                inner.last_failure_time = None;
            }
            CircuitBreakerState::Open => {
                inner.half_open_calls_used = 0;
            }
            CircuitBreakerState::HalfOpen => {}
        }

        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        metrics::set_circuit_state(&self.name, to);

        match to {
            CircuitBreakerState::Open => tracing::warn!(
                name = %self.name,
                from = %from,
                to = %to,
                failures = inner.failure_count,
                "Circuit breaker opened"
            ),
            _ => tracing::info!(name = %self.name, from = %from, to = %to, "Circuit breaker transition"),
        }
    }

    /// Force the breaker open (operator action).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Instant::now());
        self.transition(&mut inner, CircuitBreakerState::Open);
    }

    /// Force the breaker closed (operator action).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed);
    }

    /// Snapshot of counters for status reporting.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_calls_used: inner.half_open_calls_used,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Target name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Consecutive failures while closed.
    pub failure_count: u32,
    /// Test calls consumed in the current half-open window.
    pub half_open_calls_used: u32,
    /// Successful calls recorded.
    pub total_successes: u64,
    /// Failed calls recorded.
    pub total_failures: u64,
    /// Calls rejected without being attempted.
    pub total_rejections: u64,
    /// Number of state changes.
    pub state_transitions: u64,
}
