//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Upstream exchange client, codec, dispatch and REST snapshot.
pub mod upstream;

/// Downstream channel hub with push and pull fan-out.
pub mod broadcast;

/// HTTP server: WebSocket, SSE, health and metrics endpoints.
pub mod server;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
