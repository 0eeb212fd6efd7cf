//! Health, status and metrics endpoints.
//!
//! - `GET /health` - JSON health summary
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (upstream connected, hub running)
//! - `GET /status` - full hub, upstream and circuit breaker status
//! - `GET /metrics` - Prometheus metrics in text format

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ServerState;
use crate::infrastructure::broadcast::HubStatus;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::upstream::{ConnectionState, StreamClientStats};
use crate::resilience::{CircuitBreakerMetrics, CircuitBreakerState};

// =============================================================================
// Response Types
// =============================================================================

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream connected and every circuit closed.
    Healthy,
    /// Serving, but upstream is reconnecting or a circuit is open.
    Degraded,
    /// Hub or upstream stopped.
    Unhealthy,
}

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream connection state.
    pub upstream: ConnectionState,
    /// Live channels.
    pub channels: usize,
    /// Distinct push connections.
    pub push_connections: usize,
    /// Pull queues.
    pub pull_queues: usize,
}

/// `GET /status` body.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Upstream client counters.
    pub upstream: StreamClientStats,
    /// Hub counters and per-channel counts.
    pub hub: HubStatus,
    /// Circuit breakers guarding outbound calls.
    pub circuit_breakers: Vec<CircuitBreakerMetrics>,
}

// =============================================================================
// Handlers
// =============================================================================

pub(super) async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let hub = state.hub.status().await;
    let upstream = state.client.state();
    let status = determine_health_status(upstream, hub.running, &state.breaker_states());

    let response = HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream,
        channels: hub.total_channels,
        push_connections: hub.total_push_connections,
        pull_queues: hub.total_pull_queues,
    };
    (status_code(status), Json(response))
}

pub(super) async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub(super) async fn readiness_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let ready = !state.hub.is_stopped() && state.client.state() == ConnectionState::Connected;
    if ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

pub(super) async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let hub = state.hub.status().await;
    let upstream = state.client.stats();
    let circuit_breakers: Vec<_> = state.breakers.iter().map(|b| b.metrics()).collect();
    let status = determine_health_status(upstream.state, hub.running, &state.breaker_states());

    Json(StatusResponse {
        status,
        upstream,
        hub,
        circuit_breakers,
    })
}

pub(super) async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

const fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn determine_health_status(
    upstream: ConnectionState,
    hub_running: bool,
    breakers: &[CircuitBreakerState],
) -> HealthStatus {
    if !hub_running || upstream == ConnectionState::Stopped {
        return HealthStatus::Unhealthy;
    }
    let circuits_closed = breakers.iter().all(|s| *s == CircuitBreakerState::Closed);
    if upstream == ConnectionState::Connected && circuits_closed {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

impl ServerState {
    fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.breakers.iter().map(|b| b.state()).collect()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(ConnectionState::Connected, true, &[] => HealthStatus::Healthy ; "connected")]
    #[test_case(ConnectionState::Connected, true, &[CircuitBreakerState::Open] => HealthStatus::Degraded ; "circuit open")]
    #[test_case(ConnectionState::Connecting, true, &[CircuitBreakerState::Closed] => HealthStatus::Degraded ; "reconnecting")]
    #[test_case(ConnectionState::Connected, false, &[] => HealthStatus::Unhealthy ; "hub stopped")]
    #[test_case(ConnectionState::Stopped, true, &[] => HealthStatus::Unhealthy ; "upstream stopped")]
    fn determine_status(
        upstream: ConnectionState,
        hub_running: bool,
        breakers: &[CircuitBreakerState],
    ) -> HealthStatus {
        determine_health_status(upstream, hub_running, breakers)
    }
}
