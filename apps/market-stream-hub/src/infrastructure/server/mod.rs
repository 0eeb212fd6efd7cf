//! HTTP Server
//!
//! Downstream surface of the hub, served by axum on a single port.
//!
//! # Endpoints
//!
//! - `GET /ws?channels=a,b` - WebSocket push subscriber
//! - `GET /stream/{channel}` - Server-Sent Events backed by a pull queue
//! - `GET /health`, `/healthz`, `/readyz`, `/status`, `/metrics`

mod connection;
mod health;
mod sse;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use connection::{AxumPushConnection, OUTBOUND_BUFFER};
pub use health::{HealthResponse, HealthStatus, StatusResponse};
pub use ws::WsParams;

use crate::infrastructure::broadcast::{BroadcastHub, HubError};
use crate::infrastructure::upstream::StreamClient;
use crate::resilience::CircuitBreaker;

// =============================================================================
// Server State
// =============================================================================

/// Shared state for request handlers.
pub struct ServerState {
    version: String,
    started_at: Instant,
    hub: Arc<BroadcastHub>,
    client: Arc<StreamClient>,
    breakers: Vec<Arc<CircuitBreaker>>,
    outbound_buffer: usize,
}

impl ServerState {
    /// Create server state.
    #[must_use]
    pub fn new(version: impl Into<String>, hub: Arc<BroadcastHub>, client: Arc<StreamClient>) -> Self {
        Self {
            version: version.into(),
            started_at: Instant::now(),
            hub,
            client,
            breakers: Vec::new(),
            outbound_buffer: OUTBOUND_BUFFER,
        }
    }

    /// Report `breaker` in `/health` and `/status`.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breakers.push(breaker);
        self
    }

    /// Frames buffered per WebSocket before sends wait.
    #[must_use]
    pub const fn with_outbound_buffer(mut self, buffer: usize) -> Self {
        self.outbound_buffer = buffer;
        self
    }
}

/// Build the router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/stream/{channel}", get(sse::sse_handler))
        .route("/health", get(health::health_handler))
        .route("/healthz", get(health::liveness_handler))
        .route("/readyz", get(health::readiness_handler))
        .route("/status", get(health::status_handler))
        .route("/metrics", get(health::metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Axum server bound to one address.
pub struct HttpServer {
    address: String,
    state: Arc<ServerState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a server.
    #[must_use]
    pub fn new(address: impl Into<String>, state: Arc<ServerState>, cancel: CancellationToken) -> Self {
        Self {
            address: address.into(),
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the server stops with an
    /// error.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|e| ServerError::BindFailed(self.address.clone(), e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::ServerFailed` on a fatal server error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener
            .local_addr()
            .map_or_else(|_| self.address.clone(), |a| a.to_string());
        tracing::info!(address = %local, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the address.
    #[error("failed to bind {0}: {1}")]
    BindFailed(String, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

/// Hub errors surfaced as HTTP responses.
#[derive(Debug)]
pub(crate) struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(error: HubError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            HubError::InvalidChannel(_) => StatusCode::BAD_REQUEST,
            HubError::Stopped | HubError::ChannelLimit { .. } => StatusCode::SERVICE_UNAVAILABLE,
            HubError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}
