//! Broadcast Hub
//!
//! Downstream fan-out of serialized market events to named channels.
//!
//! # Architecture
//!
//! Each channel holds two kinds of consumer:
//! - Push connections, written to directly and pruned on failure
//! - Pull queues, bounded buffers that drop new messages when full
//!
//! Channels are created on first use and removed once their last consumer
//! leaves. A background sweeper sends heartbeats to idle push connections.

mod bridge;
mod heartbeat;
mod hub;
mod pull;

pub use bridge::MarketEventBridge;
pub use hub::{
    BroadcastConfig, BroadcastHub, BroadcastReport, ChannelStatus, HubError, HubStatus,
    SharedBroadcastHub,
};
pub use pull::{Enqueue, PullQueue, PullQueueId};
