//! Normalized Market Events
//!
//! The closed set of events produced from upstream frames. Every variant is
//! immutable once built; prices and volumes are [`Decimal`] parsed from the
//! exchange's numeric strings.
//!
//! Serialized form (as broadcast downstream):
//!
//! ```json
//! {"type":"ticker","data":{"symbol":"BTCUSDT","price":"43250.10", ...}}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Kind
// =============================================================================

/// Discriminant of a [`NormalizedEvent`], used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// 24h rolling ticker.
    Ticker,
    /// Individual or aggregated trade.
    Trade,
    /// Candlestick update.
    Kline,
}

impl EventKind {
    /// All kinds, in dispatch-table order.
    pub const ALL: [Self; 3] = [Self::Ticker, Self::Trade, Self::Kline];

    /// Lowercase name, also the kind-wide broadcast channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::Kline => "kline",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    /// Buyer was the taker.
    Buy,
    /// Seller was the taker (buyer is market maker).
    Sell,
}

impl TradeSide {
    /// Side from the exchange's "buyer is maker" flag.
    #[must_use]
    pub const fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker { Self::Sell } else { Self::Buy }
    }
}

/// Rolling 24h ticker for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    /// Exchange symbol, uppercase.
    pub symbol: String,
    /// Last price.
    pub price: Decimal,
    /// Absolute change over the window.
    pub price_change: Decimal,
    /// Percent change over the window.
    pub price_change_percent: Decimal,
    /// 24h high.
    pub high_24h: Decimal,
    /// 24h low.
    pub low_24h: Decimal,
    /// 24h base volume.
    pub volume_24h: Decimal,
    /// 24h quote volume.
    pub quote_volume_24h: Decimal,
    /// When the event was parsed.
    pub timestamp: DateTime<Utc>,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Exchange symbol, uppercase.
    pub symbol: String,
    /// Trade (or aggregate trade) ID.
    pub trade_id: u64,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Aggressor side.
    pub side: TradeSide,
    /// Exchange execution time.
    pub trade_time: DateTime<Utc>,
    /// Parse time.
    pub timestamp: DateTime<Utc>,
}

/// Candlestick state for one interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineEvent {
    /// Exchange symbol, uppercase.
    pub symbol: String,
    /// Interval such as `1m` or `4h`.
    pub interval: String,
    /// Candle open time.
    pub open_time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close (latest) price.
    pub close: Decimal,
    /// Base volume.
    pub volume: Decimal,
    /// Candle close time.
    pub close_time: DateTime<Utc>,
    /// Whether the candle is final.
    pub is_closed: bool,
}

// =============================================================================
// Normalized Event
// =============================================================================

/// A classified upstream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// Ticker update.
    Ticker(TickerEvent),
    /// Trade print.
    Trade(TradeEvent),
    /// Candlestick update.
    Kline(KlineEvent),
}

impl NormalizedEvent {
    /// Kind used for handler dispatch.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Ticker(_) => EventKind::Ticker,
            Self::Trade(_) => EventKind::Trade,
            Self::Kline(_) => EventKind::Kline,
        }
    }

    /// Symbol the event refers to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::Trade(t) => &t.symbol,
            Self::Kline(k) => &k.symbol,
        }
    }

    /// Per-symbol broadcast channel, e.g. `ticker:BTCUSDT` or `kline:BTCUSDT:1m`.
    #[must_use]
    pub fn symbol_channel(&self) -> String {
        match self {
            Self::Kline(k) => format!("kline:{}:{}", k.symbol, k.interval),
            other => format!("{}:{}", other.kind(), other.symbol()),
        }
    }
}

/// Convert exchange epoch milliseconds to a UTC timestamp.
#[must_use]
pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}
