//! Port Interfaces
//!
//! Contracts between the pipeline stages and the adapters plugged into
//! them, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`PushConnection`]: a downstream live connection the hub writes to
//!
//! ## Driver Ports (Inbound)
//!
//! - [`EventHandler`]: a callback the upstream client dispatches events to

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::market::NormalizedEvent;

// =============================================================================
// Event Handlers
// =============================================================================

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Build from anything printable.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Receives normalized events of the kinds it is registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are logged by the dispatcher and never
    /// affect other handlers.
    async fn handle(&self, event: &NormalizedEvent) -> Result<(), HandlerError>;
}

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&NormalizedEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    /// Wrap `f` as a shareable handler.
    pub fn shared(f: F) -> Arc<dyn EventHandler> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&NormalizedEvent) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, event: &NormalizedEvent) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}

// =============================================================================
// Push Connections
// =============================================================================

/// Unique identifier of a downstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Failure to deliver to a push connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The peer went away.
    #[error("connection closed")]
    Closed,

    /// The write did not complete in time.
    #[error("send timed out")]
    Timeout,

    /// The hub is shutting down.
    #[error("hub stopped")]
    Stopped,

    /// Transport-specific failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A downstream connection the hub pushes text frames to.
#[async_trait]
pub trait PushConnection: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> ConnectionId;

    /// Write one text message.
    async fn send(&self, text: &str) -> Result<(), SendError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}
