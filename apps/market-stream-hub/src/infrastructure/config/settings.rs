//! Hub Configuration Settings
//!
//! Configuration types for the market stream hub, loaded from `MARKET_HUB_*`
//! environment variables. Every value has a default; only malformed
//! subscription lists are rejected.

use std::time::Duration;

use crate::domain::subscription::{Subscription, SubscriptionError, parse_stream_name};
use crate::infrastructure::broadcast::BroadcastConfig;
use crate::infrastructure::upstream::{ReconnectConfig, StreamClientConfig};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Upstream exchange settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Combined-stream WebSocket host.
    pub stream_url: String,
    /// REST API host used for ticker snapshots.
    pub rest_url: String,
    /// Streams subscribed at startup (`btcusdt@ticker`, `ethusdt@kline_1m`).
    pub streams: Vec<String>,
    /// Seed the ticker cache over REST before the first live frame.
    pub seed_tickers: bool,
    /// Limit for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Limit for one REST request.
    pub request_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            stream_url: "wss://stream.binance.com:9443".to_string(),
            rest_url: "https://api.binance.com".to_string(),
            streams: Vec::new(),
            seed_tickers: true,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Upstream reconnect backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
    /// Randomization fraction (0 disables).
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            initial_delay: defaults.initial_delay,
            max_delay: defaults.max_delay,
            multiplier: defaults.multiplier,
            jitter_factor: defaults.jitter_factor,
        }
    }
}

/// Retry settings for REST calls.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub exponential_base: f64,
    /// Randomize delays by ±25%.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_retries: defaults.max_retries,
            base_delay: defaults.base_delay,
            max_delay: defaults.max_delay,
            exponential_base: defaults.exponential_base,
            jitter: defaults.jitter_enabled,
        }
    }
}

/// Circuit breaker settings for REST calls.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
    /// Probe calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout: defaults.recovery_timeout,
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

/// Broadcast hub settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Pull queue capacity.
    pub pull_queue_capacity: usize,
    /// Idle time before a heartbeat.
    pub heartbeat_idle_timeout: Duration,
    /// Heartbeat sweep interval.
    pub heartbeat_interval: Duration,
    /// Limit for one push write.
    pub send_timeout: Duration,
    /// Upper bound on live channels.
    pub max_channels: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        let defaults = BroadcastConfig::default();
        Self {
            pull_queue_capacity: defaults.pull_queue_capacity,
            heartbeat_idle_timeout: defaults.heartbeat_idle_timeout,
            heartbeat_interval: defaults.heartbeat_interval,
            send_timeout: defaults.send_timeout,
            max_channels: defaults.max_channels,
        }
    }
}

/// Ticker cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Upper bound on cached ticker symbols.
    pub max_ticker_symbols: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_ticker_symbols: StreamClientConfig::default().max_ticker_symbols,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP port for WebSocket, SSE, health and metrics.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8090,
        }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Upstream exchange settings.
    pub upstream: UpstreamSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectSettings,
    /// REST retry policy.
    pub retry: RetrySettings,
    /// REST circuit breaker.
    pub circuit_breaker: CircuitBreakerSettings,
    /// Broadcast hub.
    pub broadcast: BroadcastSettings,
    /// Ticker cache.
    pub cache: CacheSettings,
    /// HTTP server.
    pub server: ServerSettings,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_HUB_STREAMS` names an invalid stream or a
    /// value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let upstream_defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            stream_url: env.string("MARKET_HUB_STREAM_URL", upstream_defaults.stream_url),
            rest_url: env.string("MARKET_HUB_REST_URL", upstream_defaults.rest_url),
            streams: env.list("MARKET_HUB_STREAMS"),
            seed_tickers: env.bool("MARKET_HUB_SEED_TICKERS", upstream_defaults.seed_tickers),
            connect_timeout: env.duration_secs(
                "MARKET_HUB_CONNECT_TIMEOUT_SECS",
                upstream_defaults.connect_timeout,
            ),
            request_timeout: env.duration_secs(
                "MARKET_HUB_REQUEST_TIMEOUT_SECS",
                upstream_defaults.request_timeout,
            ),
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            initial_delay: env.duration_millis(
                "MARKET_HUB_RECONNECT_DELAY_INITIAL_MS",
                reconnect_defaults.initial_delay,
            ),
            max_delay: env.duration_secs(
                "MARKET_HUB_RECONNECT_DELAY_MAX_SECS",
                reconnect_defaults.max_delay,
            ),
            multiplier: env.f64(
                "MARKET_HUB_RECONNECT_DELAY_MULTIPLIER",
                reconnect_defaults.multiplier,
            ),
            jitter_factor: env.f64(
                "MARKET_HUB_RECONNECT_JITTER",
                reconnect_defaults.jitter_factor,
            ),
        };

        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_retries: env.u32("MARKET_HUB_RETRY_MAX", retry_defaults.max_retries),
            base_delay: env.duration_millis(
                "MARKET_HUB_RETRY_BASE_DELAY_MS",
                retry_defaults.base_delay,
            ),
            max_delay: env.duration_secs("MARKET_HUB_RETRY_MAX_DELAY_SECS", retry_defaults.max_delay),
            exponential_base: env.f64(
                "MARKET_HUB_RETRY_EXPONENTIAL_BASE",
                retry_defaults.exponential_base,
            ),
            jitter: env.bool("MARKET_HUB_RETRY_JITTER", retry_defaults.jitter),
        };

        let breaker_defaults = CircuitBreakerSettings::default();
        let circuit_breaker = CircuitBreakerSettings {
            failure_threshold: env.u32(
                "MARKET_HUB_CIRCUIT_FAILURE_THRESHOLD",
                breaker_defaults.failure_threshold,
            ),
            recovery_timeout: env.duration_secs(
                "MARKET_HUB_CIRCUIT_RECOVERY_TIMEOUT_SECS",
                breaker_defaults.recovery_timeout,
            ),
            half_open_max_calls: env.u32(
                "MARKET_HUB_CIRCUIT_HALF_OPEN_MAX_CALLS",
                breaker_defaults.half_open_max_calls,
            ),
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            pull_queue_capacity: env.usize(
                "MARKET_HUB_PULL_QUEUE_CAPACITY",
                broadcast_defaults.pull_queue_capacity,
            ),
            heartbeat_idle_timeout: env.duration_secs(
                "MARKET_HUB_HEARTBEAT_IDLE_SECS",
                broadcast_defaults.heartbeat_idle_timeout,
            ),
            heartbeat_interval: env.duration_secs(
                "MARKET_HUB_HEARTBEAT_INTERVAL_SECS",
                broadcast_defaults.heartbeat_interval,
            ),
            send_timeout: env.duration_millis(
                "MARKET_HUB_SEND_TIMEOUT_MS",
                broadcast_defaults.send_timeout,
            ),
            max_channels: env.usize("MARKET_HUB_MAX_CHANNELS", broadcast_defaults.max_channels),
        };

        let cache = CacheSettings {
            max_ticker_symbols: env.usize(
                "MARKET_HUB_MAX_TICKER_SYMBOLS",
                CacheSettings::default().max_ticker_symbols,
            ),
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            host: env.string("MARKET_HUB_HOST", server_defaults.host),
            http_port: env.u16("MARKET_HUB_HTTP_PORT", server_defaults.http_port),
        };

        let config = Self {
            upstream,
            reconnect,
            retry,
            circuit_breaker,
            broadcast,
            cache,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.subscriptions()?;
        let durations = [
            ("MARKET_HUB_CONNECT_TIMEOUT_SECS", self.upstream.connect_timeout),
            ("MARKET_HUB_REQUEST_TIMEOUT_SECS", self.upstream.request_timeout),
            ("MARKET_HUB_RECONNECT_DELAY_INITIAL_MS", self.reconnect.initial_delay),
            ("MARKET_HUB_HEARTBEAT_INTERVAL_SECS", self.broadcast.heartbeat_interval),
            ("MARKET_HUB_SEND_TIMEOUT_MS", self.broadcast.send_timeout),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::InvalidValue {
                key: (*key).to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_HUB_RECONNECT_DELAY_MULTIPLIER".to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_HUB_RECONNECT_JITTER".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.broadcast.max_channels == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_HUB_MAX_CHANNELS".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Startup subscriptions parsed from `upstream.streams`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidStream`] for a name that is not a
    /// ticker, trade, aggTrade or kline stream.
    pub fn subscriptions(&self) -> Result<Vec<Subscription>, ConfigError> {
        self.upstream
            .streams
            .iter()
            .map(|name| {
                parse_stream_name(name).map_err(|source| ConfigError::InvalidStream {
                    stream: name.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Symbols to seed over REST: those with a ticker subscription, or all
    /// symbols when none is configured.
    #[must_use]
    pub fn seed_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .subscriptions()
            .unwrap_or_default()
            .iter()
            .filter(|s| s.kind() == crate::domain::subscription::StreamKind::Ticker)
            .map(|s| s.symbol().to_string())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Stream client configuration.
    #[must_use]
    pub fn stream_client_config(&self) -> StreamClientConfig {
        StreamClientConfig {
            base_url: self.upstream.stream_url.clone(),
            reconnect: ReconnectConfig {
                initial_delay: self.reconnect.initial_delay,
                max_delay: self.reconnect.max_delay,
                multiplier: self.reconnect.multiplier,
                jitter_factor: self.reconnect.jitter_factor,
            },
            max_ticker_symbols: self.cache.max_ticker_symbols,
            connect_timeout: self.upstream.connect_timeout,
            ..StreamClientConfig::default()
        }
    }

    /// Retry policy for REST calls.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            self.retry.base_delay,
            self.retry.max_delay,
            self.retry.exponential_base,
            self.retry.jitter,
        )
    }

    /// Circuit breaker configuration for REST calls.
    #[must_use]
    pub const fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.circuit_breaker.failure_threshold,
            self.circuit_breaker.recovery_timeout,
            self.circuit_breaker.half_open_max_calls,
        )
    }

    /// Broadcast hub configuration.
    #[must_use]
    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            pull_queue_capacity: self.broadcast.pull_queue_capacity,
            heartbeat_idle_timeout: self.broadcast.heartbeat_idle_timeout,
            heartbeat_interval: self.broadcast.heartbeat_interval,
            send_timeout: self.broadcast.send_timeout,
            max_channels: self.broadcast.max_channels,
            ..BroadcastConfig::default()
        }
    }

    /// Socket address for the HTTP server.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configured stream name could not be parsed.
    #[error("invalid stream {stream:?}: {source}")]
    InvalidStream {
        /// The offending entry.
        stream: String,
        /// Parse failure.
        source: SubscriptionError,
    },
    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Typed reads over a key lookup. Unparseable values fall back to defaults.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.raw(key)?;
        let parsed = raw.parse().ok();
        if parsed.is_none() {
            tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
        }
        parsed
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).unwrap_or(default)
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.raw(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.raw(key).map_or(default, |v| {
            matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parse(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parse(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse(key).unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_millis)
    }
}
