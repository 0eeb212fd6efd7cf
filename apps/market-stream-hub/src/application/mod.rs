//! Application Layer - Port definitions.
//!
//! The seams between the upstream client, the broadcast hub and the
//! adapters that plug into them.

/// Port interfaces for event handlers and push connections.
pub mod ports;
