//! Upstream exchange adapters.
//!
//! - `client`: combined-stream WebSocket client with reconnect
//! - `codec`: frame decoding into normalized events
//! - `dispatcher`: per-kind handler registry
//! - `messages`: wire types
//! - `reconnect`: backoff schedule
//! - `rest`: REST ticker snapshot

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod messages;
pub mod reconnect;
pub mod rest;

pub use client::{
    ConnectionState, ListenOutcome, StreamClient, StreamClientConfig, StreamClientError,
    StreamClientStats,
};
pub use codec::{CodecError, FrameDecoder};
pub use dispatcher::{EventDispatcher, HandlerId};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rest::{RestTickerSource, TICKER_24HR_PATH};
