//! Resilience for outbound request/response calls.
//!
//! - [`RetryPolicy`]: pure backoff schedule
//! - [`CircuitBreaker`]: consecutive-failure breaker
//! - [`ResilientExecutor`]: runs a call under both
//! - [`ResilientHttpClient`]: JSON GETs over `reqwest` through the executor

mod circuit_breaker;
mod executor;
mod http;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerState,
};
pub use executor::{CallError, ExecutorError, ResilientExecutor};
pub use http::ResilientHttpClient;
pub use retry::{
    ErrorCategory, JITTER_FACTOR, RetryPolicy, categorize_status, parse_retry_after,
    parse_retry_after_at,
};
