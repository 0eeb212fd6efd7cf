//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Upstream**: Frames received, payloads dropped, connection state, reconnects
//! - **Dispatch**: Events dispatched and handler failures by kind
//! - **Hub**: Channels, push connections, deliveries, pruning, heartbeats
//! - **Resilience**: Circuit breaker state, rejections, retries
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market::EventKind;
use crate::infrastructure::broadcast::BroadcastReport;
use crate::infrastructure::upstream::ConnectionState;
use crate::resilience::{CircuitBreakerState, ErrorCategory};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the existing handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream
    describe_counter!(
        "market_hub_frames_received_total",
        "Total frames received from the upstream stream"
    );
    describe_counter!(
        "market_hub_payloads_dropped_total",
        "Upstream payloads dropped by reason"
    );
    describe_gauge!(
        "market_hub_upstream_connected",
        "1 when the upstream stream is connected"
    );
    describe_counter!(
        "market_hub_reconnects_total",
        "Total upstream reconnection attempts"
    );

    // Dispatch
    describe_counter!(
        "market_hub_events_dispatched_total",
        "Normalized events dispatched by kind"
    );
    describe_counter!(
        "market_hub_handler_failures_total",
        "Event handler errors and panics by kind"
    );

    // Hub
    describe_gauge!("market_hub_channels", "Live broadcast channels");
    describe_gauge!(
        "market_hub_push_connections",
        "Distinct push connections across channels"
    );
    describe_counter!(
        "market_hub_messages_delivered_total",
        "Messages accepted by push connections and pull queues"
    );
    describe_counter!(
        "market_hub_messages_dropped_total",
        "Messages dropped on full pull queues"
    );
    describe_counter!(
        "market_hub_connections_pruned_total",
        "Push connections removed after a failed send"
    );
    describe_counter!(
        "market_hub_heartbeats_total",
        "Heartbeats sent to idle push connections"
    );

    // Resilience
    describe_gauge!(
        "market_hub_circuit_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)"
    );
    describe_counter!(
        "market_hub_circuit_rejections_total",
        "Calls rejected by an open circuit"
    );
    describe_counter!(
        "market_hub_retries_total",
        "Retries by error category"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reasons an upstream payload is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame was not valid JSON.
    InvalidJson,
    /// Payload was not a JSON object.
    NotObject,
    /// Recognized kind but missing or invalid fields.
    Malformed,
    /// No known event type.
    Unclassified,
}

impl DropReason {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::NotObject => "not_object",
            Self::Malformed => "malformed",
            Self::Unclassified => "unclassified",
        }
    }
}

/// Record a frame received from upstream.
pub fn record_frame_received() {
    counter!("market_hub_frames_received_total").increment(1);
}

/// Record a discarded upstream payload.
pub fn record_dropped_payload(reason: DropReason) {
    counter!(
        "market_hub_payloads_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Update the upstream connection gauge.
pub fn set_upstream_state(state: ConnectionState) {
    let connected = if state == ConnectionState::Connected { 1.0 } else { 0.0 };
    gauge!("market_hub_upstream_connected").set(connected);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("market_hub_reconnects_total").increment(1);
}

/// Record an event passed to the dispatcher.
pub fn record_event_dispatched(kind: EventKind) {
    counter!(
        "market_hub_events_dispatched_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a handler error or panic.
pub fn record_handler_failure(kind: EventKind) {
    counter!(
        "market_hub_handler_failures_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Update the live channel count.
#[allow(clippy::cast_precision_loss)]
pub fn set_hub_channels(count: usize) {
    gauge!("market_hub_channels").set(count as f64);
}

/// Update the distinct push connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_push_connections(count: usize) {
    gauge!("market_hub_push_connections").set(count as f64);
}

/// Record the outcome of one broadcast.
///
/// Channel names are unbounded, so only the kind prefix is used as a label.
pub fn record_broadcast(channel: &str, report: &BroadcastReport) {
    let kind = channel.split(':').next().unwrap_or(channel).to_string();
    if report.delivered > 0 {
        counter!(
            "market_hub_messages_delivered_total",
            "channel" => kind.clone()
        )
        .increment(report.delivered as u64);
    }
    if report.dropped > 0 {
        counter!(
            "market_hub_messages_dropped_total",
            "channel" => kind
        )
        .increment(report.dropped as u64);
    }
}

/// Record a pruned push connection.
pub fn record_connection_pruned() {
    counter!("market_hub_connections_pruned_total").increment(1);
}

/// Record heartbeats sent in one sweep.
pub fn record_heartbeats(count: usize) {
    if count > 0 {
        counter!("market_hub_heartbeats_total").increment(count as u64);
    }
}

/// Update a circuit breaker's state gauge.
pub fn set_circuit_state(name: &str, state: CircuitBreakerState) {
    let value = match state {
        CircuitBreakerState::Closed => 0.0,
        CircuitBreakerState::HalfOpen => 1.0,
        CircuitBreakerState::Open => 2.0,
    };
    gauge!("market_hub_circuit_state", "name" => name.to_string()).set(value);
}

/// Record a call rejected by an open circuit.
pub fn record_circuit_rejection(name: &str) {
    counter!(
        "market_hub_circuit_rejections_total",
        "name" => name.to_string()
    )
    .increment(1);
}

/// Record a retry scheduled by the executor.
pub fn record_executor_retry(name: &str, category: ErrorCategory) {
    counter!(
        "market_hub_retries_total",
        "name" => name.to_string(),
        "category" => category.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
