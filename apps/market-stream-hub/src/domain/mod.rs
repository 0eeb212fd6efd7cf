//! Domain Layer - Market event and subscription types.
//!
//! Pure data types with serialization support and no I/O. Everything the
//! upstream client produces and the broadcast hub distributes is defined
//! here.

/// Normalized market events (ticker, trade, kline).
pub mod market;

/// Upstream stream subscriptions and the active subscription set.
pub mod subscription;
