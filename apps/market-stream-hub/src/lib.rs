#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream Hub - Market Data Ingest and Fan-out
//!
//! Maintains one multiplexed WebSocket connection to an exchange's combined
//! stream endpoint, normalizes frames into typed events and fans them out
//! to downstream subscribers grouped by channel.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market types with no I/O
//!   - `market`: Normalized ticker, trade and kline events
//!   - `subscription`: Upstream stream names and subscription sets
//!
//! - **Application**: Port definitions
//!   - `ports`: Event handlers and push connections
//!
//! - **Resilience**: Retry policy, circuit breaker, resilient executor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: Stream client, codec, dispatcher, REST snapshot
//!   - `broadcast`: Channel hub with push and pull consumers
//!   - `server`: WebSocket, SSE, health and metrics endpoints
//!   - `config`: Environment configuration
//!
//! # Data Flow
//!
//! ```text
//!                  ┌──────────────┐     ┌─────────────┐     ┌─────────────┐
//! Exchange WS ────►│ StreamClient │────►│  Dispatcher │────►│ Broadcast   │──► WS client 1
//!                  │  + codec     │     │  (per kind) │     │    Hub      │──► WS client 2
//! Exchange REST ──►│ ticker cache │     └─────────────┘     │ (channels)  │──► SSE queue N
//!  (snapshot)      └──────────────┘                         └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market types with no external dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Resilient execution of outbound calls.
pub mod resilience;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    EventKind, KlineEvent, NormalizedEvent, TickerEvent, TradeEvent, TradeSide,
};
pub use domain::subscription::{StreamKind, Subscription, SubscriptionError, SubscriptionSet};

// Ports
pub use application::ports::{
    ConnectionId, EventHandler, FnHandler, HandlerError, PushConnection, SendError,
};

// Resilience
pub use resilience::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, ExecutorError,
    ResilientExecutor, ResilientHttpClient, RetryPolicy,
};

// Upstream
pub use infrastructure::upstream::{
    ConnectionState, EventDispatcher, ReconnectConfig, RestTickerSource, StreamClient,
    StreamClientConfig, StreamClientError,
};

// Broadcast hub
pub use infrastructure::broadcast::{
    BroadcastConfig, BroadcastHub, BroadcastReport, HubError, HubStatus, MarketEventBridge,
    PullQueue, SharedBroadcastHub,
};

// Server
pub use infrastructure::server::{HttpServer, ServerError, ServerState};

// Configuration
pub use infrastructure::config::{ConfigError, HubConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
