//! Configuration Module
//!
//! Configuration loading for the hub service.

mod settings;

pub use settings::{
    BroadcastSettings, CacheSettings, CircuitBreakerSettings, ConfigError, HubConfig,
    ReconnectSettings, RetrySettings, ServerSettings, UpstreamSettings,
};
