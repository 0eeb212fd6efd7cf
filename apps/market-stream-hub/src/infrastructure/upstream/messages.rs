//! Binance Wire Message Types
//!
//! Serde mappings for the combined-stream payloads and the REST 24h ticker.
//! Field names follow the exchange's single-letter schema; numeric values
//! arrive as strings and are decoded straight into [`Decimal`].
//!
//! # Stream Payloads
//!
//! | `e` | Stream suffix | Type |
//! |-----|---------------|------|
//! | `24hrMiniTicker` | `@miniTicker`, `!miniTicker@arr` | [`MiniTickerMessage`] |
//! | `24hrTicker` | `@ticker` | [`TickerMessage`] |
//! | `trade` | `@trade` | [`TradeMessage`] |
//! | `aggTrade` | `@aggTrade` | [`AggTradeMessage`] |
//! | `kline` | `@kline_<interval>` | [`KlineMessage`] |
//!
//! # References
//!
//! - [WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)
//! - [24hr Ticker](https://developers.binance.com/docs/binance-spot-api-docs/rest-api/market-data-endpoints)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Combined-stream envelope.
///
/// ```json
/// {"stream": "btcusdt@trade", "data": {"e": "trade", ...}}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    /// Stream name the payload came from.
    pub stream: String,
    /// Raw payload (object or array).
    pub data: serde_json::Value,
}

/// Payload classification, from the `e` field or the stream name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    /// 24h mini ticker (no change fields).
    MiniTicker,
    /// 24h full ticker.
    Ticker,
    /// Raw trade.
    Trade,
    /// Aggregated trade.
    AggTrade,
    /// Candlestick.
    Kline,
}

impl WireKind {
    /// Kind from the payload's `e` field.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "24hrMiniTicker" => Some(Self::MiniTicker),
            "24hrTicker" => Some(Self::Ticker),
            "trade" => Some(Self::Trade),
            "aggTrade" => Some(Self::AggTrade),
            "kline" => Some(Self::Kline),
            _ => None,
        }
    }

    /// Kind from a combined-stream name.
    #[must_use]
    pub fn from_stream_name(stream: &str) -> Option<Self> {
        if stream == "!miniTicker@arr" || stream.ends_with("@miniTicker") {
            Some(Self::MiniTicker)
        } else if stream == "!ticker@arr" || stream.ends_with("@ticker") {
            Some(Self::Ticker)
        } else if stream.ends_with("@trade") {
            Some(Self::Trade)
        } else if stream.ends_with("@aggTrade") {
            Some(Self::AggTrade)
        } else if stream.contains("@kline_") {
            Some(Self::Kline)
        } else {
            None
        }
    }
}

/// Mini ticker.
///
/// ```json
/// {"e":"24hrMiniTicker","E":1672515782136,"s":"BNBBTC","c":"0.0025","o":"0.0010",
///  "h":"0.0025","l":"0.0010","v":"10000","q":"18"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniTickerMessage {
    /// Event time (epoch ms).
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Close (last) price.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// Open price.
    #[serde(rename = "o", default)]
    pub open: Option<Decimal>,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Quote asset volume.
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
}

/// Full 24h ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerMessage {
    /// Event time (epoch ms).
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Price change.
    #[serde(rename = "p")]
    pub price_change: Decimal,
    /// Price change percent.
    #[serde(rename = "P")]
    pub price_change_percent: Decimal,
    /// Last price.
    #[serde(rename = "c")]
    pub last_price: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Quote asset volume.
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
}

/// Raw trade.
///
/// ```json
/// {"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100",
///  "T":1672515782136,"m":true}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeMessage {
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade ID.
    #[serde(rename = "t")]
    pub trade_id: u64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Trade time (epoch ms).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer is the market maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

/// Aggregated trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggTradeMessage {
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Aggregate trade ID.
    #[serde(rename = "a")]
    pub agg_trade_id: u64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Trade time (epoch ms).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer is the market maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

/// Kline update wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineMessage {
    /// Symbol.
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    /// Candle body.
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

/// Candle body.
///
/// ```json
/// {"t":1672515780000,"T":1672515839999,"s":"BNBBTC","i":"1m","o":"0.0010",
///  "c":"0.0020","h":"0.0025","l":"0.0015","v":"1000","x":false}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlinePayload {
    /// Open time (epoch ms).
    #[serde(rename = "t")]
    pub open_time: i64,
    /// Close time (epoch ms).
    #[serde(rename = "T")]
    pub close_time: i64,
    /// Symbol.
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    /// Interval.
    #[serde(rename = "i")]
    pub interval: String,
    /// Open price.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// Close price.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Candle is closed.
    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// REST `GET /api/v3/ticker/24hr` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTicker24hr {
    /// Symbol.
    pub symbol: String,
    /// Price change.
    pub price_change: Decimal,
    /// Price change percent.
    pub price_change_percent: Decimal,
    /// Last price.
    pub last_price: Decimal,
    /// High price.
    pub high_price: Decimal,
    /// Low price.
    pub low_price: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Quote asset volume.
    pub quote_volume: Decimal,
    /// Window close time (epoch ms).
    #[serde(default)]
    pub close_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use test_case::test_case;

    #[test_case("24hrMiniTicker", Some(WireKind::MiniTicker) ; "mini ticker")]
    #[test_case("24hrTicker", Some(WireKind::Ticker) ; "ticker")]
    #[test_case("trade", Some(WireKind::Trade) ; "trade")]
    #[test_case("aggTrade", Some(WireKind::AggTrade) ; "agg trade")]
    #[test_case("kline", Some(WireKind::Kline) ; "kline")]
    #[test_case("depthUpdate", None ; "depth")]
    fn kind_from_event_type(e: &str, expected: Option<WireKind>) {
        assert_eq!(WireKind::from_event_type(e), expected);
    }

    #[test_case("!miniTicker@arr", Some(WireKind::MiniTicker) ; "all mini tickers")]
    #[test_case("btcusdt@miniTicker", Some(WireKind::MiniTicker) ; "mini ticker")]
    #[test_case("btcusdt@ticker", Some(WireKind::Ticker) ; "ticker")]
    #[test_case("btcusdt@trade", Some(WireKind::Trade) ; "trade")]
    #[test_case("btcusdt@aggTrade", Some(WireKind::AggTrade) ; "agg trade")]
    #[test_case("btcusdt@kline_1m", Some(WireKind::Kline) ; "kline")]
    #[test_case("btcusdt@depth", None ; "depth")]
    fn kind_from_stream_name(stream: &str, expected: Option<WireKind>) {
        assert_eq!(WireKind::from_stream_name(stream), expected);
    }

    #[test]
    fn trade_distinguishes_case_sensitive_fields() {
        let json = r#"{"e":"trade","E":1,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":1672515782136,"m":true}"#;
        let msg: TradeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.trade_id, 12345);
        assert_eq!(msg.trade_time, 1_672_515_782_136);
        assert_eq!(msg.price, Decimal::from_str("0.001").unwrap());
        assert!(msg.buyer_is_maker);
    }

    #[test]
    fn rest_ticker_camel_case() {
        let json = r#"{"symbol":"BTCUSDT","priceChange":"-94.99","priceChangePercent":"-0.22",
            "lastPrice":"43250.10","highPrice":"44000","lowPrice":"42000","volume":"1000.5",
            "quoteVolume":"43000000","closeTime":1499869899040}"#;
        let ticker: RestTicker24hr = serde_json::from_str(json).unwrap();
        assert_eq!(ticker.symbol, "BTCUSDT");
        assert_eq!(ticker.price_change, Decimal::from_str("-94.99").unwrap());
        assert_eq!(ticker.close_time, Some(1_499_869_899_040));
    }
}
