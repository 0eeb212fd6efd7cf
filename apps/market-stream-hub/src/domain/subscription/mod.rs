//! Upstream Subscriptions
//!
//! A [`Subscription`] names one upstream stream. The [`SubscriptionSet`]
//! holds the active, deduplicated set; on every (re)connect it is turned
//! into a combined-stream URL:
//!
//! ```text
//! <base>/stream?streams=btcusdt@ticker/ethusdt@kline_1m
//! ```
//!
//! An empty set means "every symbol's mini ticker" (`!miniTicker@arr`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream used when no explicit subscription exists.
pub const ALL_MINI_TICKERS: &str = "!miniTicker@arr";

/// Kline intervals accepted by the exchange.
pub const KLINE_INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

/// Invalid subscription request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Symbol was empty or contained non-alphanumeric characters.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Interval is not one the exchange supports.
    #[error("invalid kline interval: {0:?}")]
    InvalidInterval(String),
}

/// Upstream stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    /// Full 24h ticker (`@ticker`).
    Ticker,
    /// Raw trades (`@trade`).
    Trade,
    /// Aggregated trades (`@aggTrade`).
    AggTrade,
    /// Candlesticks (`@kline_<interval>`).
    Kline,
}

/// One upstream stream, unique by (symbol, kind, interval).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    symbol: String,
    kind: StreamKind,
    interval: Option<String>,
}

impl Subscription {
    /// 24h ticker for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::InvalidSymbol`] for an empty or
    /// non-alphanumeric symbol.
    pub fn ticker(symbol: &str) -> Result<Self, SubscriptionError> {
        Self::simple(symbol, StreamKind::Ticker)
    }

    /// Raw trades for `symbol`.
    ///
    /// # Errors
    ///
    /// See [`Subscription::ticker`].
    pub fn trade(symbol: &str) -> Result<Self, SubscriptionError> {
        Self::simple(symbol, StreamKind::Trade)
    }

    /// Aggregated trades for `symbol`.
    ///
    /// # Errors
    ///
    /// See [`Subscription::ticker`].
    pub fn agg_trade(symbol: &str) -> Result<Self, SubscriptionError> {
        Self::simple(symbol, StreamKind::AggTrade)
    }

    /// Candlesticks for `symbol` at `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::InvalidInterval`] for an unsupported
    /// interval, or [`SubscriptionError::InvalidSymbol`].
    pub fn kline(symbol: &str, interval: &str) -> Result<Self, SubscriptionError> {
        if !KLINE_INTERVALS.contains(&interval) {
            return Err(SubscriptionError::InvalidInterval(interval.to_string()));
        }
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            kind: StreamKind::Kline,
            interval: Some(interval.to_string()),
        })
    }

    fn simple(symbol: &str, kind: StreamKind) -> Result<Self, SubscriptionError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            kind,
            interval: None,
        })
    }

    /// Uppercase symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Stream type.
    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Kline interval, if this is a kline stream.
    #[must_use]
    pub fn interval(&self) -> Option<&str> {
        self.interval.as_deref()
    }

    /// Combined-stream name, e.g. `btcusdt@kline_1m`.
    #[must_use]
    pub fn stream_name(&self) -> String {
        let symbol = self.symbol.to_lowercase();
        match (self.kind, self.interval.as_deref()) {
            (StreamKind::Ticker, _) => format!("{symbol}@ticker"),
            (StreamKind::Trade, _) => format!("{symbol}@trade"),
            (StreamKind::AggTrade, _) => format!("{symbol}@aggTrade"),
            (StreamKind::Kline, interval) => {
                format!("{symbol}@kline_{}", interval.unwrap_or("1m"))
            }
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.stream_name())
    }
}

fn normalize_symbol(symbol: &str) -> Result<String, SubscriptionError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SubscriptionError::InvalidSymbol(symbol.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Deduplicated set of active subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    entries: BTreeSet<Subscription>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns `false` if it was already present.
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        self.entries.insert(subscription)
    }

    /// Remove a subscription. Returns `false` if it was not present.
    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        self.entries.remove(subscription)
    }

    /// Whether `subscription` is active.
    #[must_use]
    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.entries.contains(subscription)
    }

    /// Number of explicit subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no explicit subscription exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in stable order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    /// Stream names to request, falling back to all mini tickers.
    #[must_use]
    pub fn stream_names(&self) -> Vec<String> {
        if self.entries.is_empty() {
            return vec![ALL_MINI_TICKERS.to_string()];
        }
        self.entries.iter().map(Subscription::stream_name).collect()
    }

    /// Combined-stream URL under `base_url`.
    #[must_use]
    pub fn stream_url(&self, base_url: &str) -> String {
        format!(
            "{}/stream?streams={}",
            base_url.trim_end_matches('/'),
            self.stream_names().join("/")
        )
    }
}

impl FromIterator<Subscription> for SubscriptionSet {
    fn from_iter<I: IntoIterator<Item = Subscription>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Parse a startup subscription such as `btcusdt@ticker` or `ETHUSDT@kline_5m`.
///
/// # Errors
///
/// Returns a [`SubscriptionError`] for an unknown stream suffix, symbol or
/// interval.
pub fn parse_stream_name(name: &str) -> Result<Subscription, SubscriptionError> {
    let (symbol, stream) = name
        .trim()
        .split_once('@')
        .ok_or_else(|| SubscriptionError::InvalidSymbol(name.to_string()))?;

    match stream {
        "ticker" => Subscription::ticker(symbol),
        "trade" => Subscription::trade(symbol),
        "aggTrade" => Subscription::agg_trade(symbol),
        other => match other.strip_prefix("kline_") {
            Some(interval) => Subscription::kline(symbol, interval),
            None => Err(SubscriptionError::InvalidInterval(other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn stream_names_are_lowercase_symbols() {
        assert_eq!(Subscription::ticker("BTCUSDT").unwrap().stream_name(), "btcusdt@ticker");
        assert_eq!(Subscription::trade("ethusdt").unwrap().stream_name(), "ethusdt@trade");
        assert_eq!(
            Subscription::agg_trade("SolUsdt").unwrap().stream_name(),
            "solusdt@aggTrade"
        );
        assert_eq!(
            Subscription::kline("BTCUSDT", "1M").unwrap().stream_name(),
            "btcusdt@kline_1M"
        );
    }

    #[test_case("" ; "empty")]
    #[test_case("BTC/USDT" ; "slash")]
    #[test_case("btc usdt" ; "space")]
    fn invalid_symbols_rejected(symbol: &str) {
        assert!(matches!(
            Subscription::ticker(symbol),
            Err(SubscriptionError::InvalidSymbol(_))
        ));
    }

    #[test]
    fn invalid_interval_rejected() {
        assert_eq!(
            Subscription::kline("BTCUSDT", "7m"),
            Err(SubscriptionError::InvalidInterval("7m".to_string()))
        );
    }

    #[test]
    fn set_deduplicates_by_identity() {
        let mut set = SubscriptionSet::new();
        assert!(set.insert(Subscription::ticker("btcusdt").unwrap()));
        assert!(!set.insert(Subscription::ticker("BTCUSDT").unwrap()));
        assert!(set.insert(Subscription::kline("BTCUSDT", "1m").unwrap()));
        assert!(set.insert(Subscription::kline("BTCUSDT", "5m").unwrap()));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn empty_set_uses_all_mini_tickers() {
        let set = SubscriptionSet::new();
        assert_eq!(set.stream_names(), vec![ALL_MINI_TICKERS.to_string()]);
        assert_eq!(
            set.stream_url("wss://stream.binance.com:9443/"),
            "wss://stream.binance.com:9443/stream?streams=!miniTicker@arr"
        );
    }

    #[test]
    fn stream_url_joins_names() {
        let set: SubscriptionSet = [
            Subscription::ticker("BTCUSDT").unwrap(),
            Subscription::trade("ETHUSDT").unwrap(),
        ]
        .into_iter()
        .collect();

        let url = set.stream_url("wss://example.test");
        assert!(url.starts_with("wss://example.test/stream?streams="));
        assert!(url.contains("btcusdt@ticker"));
        assert!(url.contains("ethusdt@trade"));
        assert_eq!(url.matches('/').count(), 4);
    }

    #[test]
    fn remove_reverts_to_default_stream() {
        let sub = Subscription::trade("BTCUSDT").unwrap();
        let mut set = SubscriptionSet::new();
        set.insert(sub.clone());
        assert!(set.remove(&sub));
        assert!(!set.remove(&sub));
        assert!(set.is_empty());
        assert_eq!(set.stream_names(), vec![ALL_MINI_TICKERS.to_string()]);
    }

    #[test_case("btcusdt@ticker", StreamKind::Ticker, None ; "ticker")]
    #[test_case("ETHUSDT@aggTrade", StreamKind::AggTrade, None ; "agg trade")]
    #[test_case("solusdt@kline_15m", StreamKind::Kline, Some("15m") ; "kline")]
    fn parses_stream_names(name: &str, kind: StreamKind, interval: Option<&str>) {
        let sub = parse_stream_name(name).unwrap();
        assert_eq!(sub.kind(), kind);
        assert_eq!(sub.interval(), interval);
    }

    #[test]
    fn rejects_unknown_stream_suffix() {
        assert!(parse_stream_name("btcusdt@depth").is_err());
        assert!(parse_stream_name("btcusdt").is_err());
    }
}
