//! Frame Codec
//!
//! Turns raw combined-stream text frames into [`NormalizedEvent`]s.
//!
//! A frame is an object or an array (handled element by element),
//! optionally wrapped in `{"stream": ..., "data": ...}`. The payload kind
//! comes from the `e` field when present, otherwise from the stream-name
//! suffix. Payloads that are not objects, or that fail to parse, are
//! logged and skipped; they never abort the rest of the frame.
//!
//! Mini tickers carry no change fields, so the decoder keeps the last seen
//! price per symbol and derives change and percent from it (the first
//! observation of a symbol reports zero change).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::messages::{
    AggTradeMessage, KlineMessage, MiniTickerMessage, StreamEnvelope, TickerMessage, TradeMessage,
    WireKind,
};
use crate::domain::market::{
    KlineEvent, NormalizedEvent, TickerEvent, TradeEvent, TradeSide, from_epoch_millis,
};
use crate::infrastructure::metrics::{self, DropReason};

/// Frame-level decode failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame is not valid JSON.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload could not be mapped to an event.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Stateful decoder for upstream frames.
#[derive(Debug)]
pub struct FrameDecoder {
    last_prices: HashMap<String, Decimal>,
    max_symbols: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl FrameDecoder {
    /// Create a decoder tracking last prices for at most `max_symbols`.
    #[must_use]
    pub fn new(max_symbols: usize) -> Self {
        Self {
            last_prices: HashMap::new(),
            max_symbols,
        }
    }

    /// Decode a text frame into zero or more events, in frame order.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the frame is not JSON. Individual bad
    /// payloads inside a valid frame are dropped instead.
    pub fn decode(&mut self, text: &str) -> Result<Vec<NormalizedEvent>, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        let mut events = Vec::new();
        self.decode_value(value, None, &mut events);
        Ok(events)
    }

    fn decode_value(&mut self, value: Value, stream: Option<&str>, out: &mut Vec<NormalizedEvent>) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.decode_value(item, stream, out);
                }
            }
            Value::Object(ref map) if map.contains_key("stream") && map.contains_key("data") => {
                match serde_json::from_value::<StreamEnvelope>(value) {
                    Ok(envelope) => self.decode_value(envelope.data, Some(&envelope.stream), out),
                    Err(e) => drop_payload(DropReason::Malformed, &e.to_string(), stream),
                }
            }
            Value::Object(ref map) => {
                let kind = map
                    .get("e")
                    .and_then(Value::as_str)
                    .and_then(WireKind::from_event_type)
                    .or_else(|| stream.and_then(WireKind::from_stream_name));

                let Some(kind) = kind else {
                    // Control replies such as {"result":null,"id":1} land here.
                    tracing::debug!(stream = ?stream, "Ignoring unclassified payload");
                    metrics::record_dropped_payload(DropReason::Unclassified);
                    return;
                };

                match self.parse(kind, value) {
                    Ok(event) => out.push(event),
                    Err(e) => drop_payload(DropReason::Malformed, &e.to_string(), stream),
                }
            }
            other => drop_payload(
                DropReason::NotObject,
                &format!("expected object, got {}", json_type(&other)),
                stream,
            ),
        }
    }

    fn parse(&mut self, kind: WireKind, value: Value) -> Result<NormalizedEvent, CodecError> {
        let event = match kind {
            WireKind::MiniTicker => {
                let msg: MiniTickerMessage = from_payload(value)?;
                NormalizedEvent::Ticker(self.mini_ticker(msg))
            }
            WireKind::Ticker => {
                let msg: TickerMessage = from_payload(value)?;
                self.remember_price(&msg.symbol, msg.last_price);
                NormalizedEvent::Ticker(TickerEvent {
                    symbol: msg.symbol,
                    price: msg.last_price,
                    price_change: msg.price_change,
                    price_change_percent: msg.price_change_percent,
                    high_24h: msg.high,
                    low_24h: msg.low,
                    volume_24h: msg.volume,
                    quote_volume_24h: msg.quote_volume,
                    timestamp: Utc::now(),
                })
            }
            WireKind::Trade => {
                let msg: TradeMessage = from_payload(value)?;
                NormalizedEvent::Trade(TradeEvent {
                    symbol: msg.symbol,
                    trade_id: msg.trade_id,
                    price: msg.price,
                    quantity: msg.quantity,
                    side: TradeSide::from_buyer_is_maker(msg.buyer_is_maker),
                    trade_time: epoch(msg.trade_time)?,
                    timestamp: Utc::now(),
                })
            }
            WireKind::AggTrade => {
                let msg: AggTradeMessage = from_payload(value)?;
                NormalizedEvent::Trade(TradeEvent {
                    symbol: msg.symbol,
                    trade_id: msg.agg_trade_id,
                    price: msg.price,
                    quantity: msg.quantity,
                    side: TradeSide::from_buyer_is_maker(msg.buyer_is_maker),
                    trade_time: epoch(msg.trade_time)?,
                    timestamp: Utc::now(),
                })
            }
            WireKind::Kline => {
                let msg: KlineMessage = from_payload(value)?;
                let k = msg.kline;
                let symbol = k
                    .symbol
                    .or(msg.symbol)
                    .ok_or_else(|| CodecError::InvalidPayload("kline without symbol".into()))?;
                NormalizedEvent::Kline(KlineEvent {
                    symbol,
                    interval: k.interval,
                    open_time: epoch(k.open_time)?,
                    open: k.open,
                    high: k.high,
                    low: k.low,
                    close: k.close,
                    volume: k.volume,
                    close_time: epoch(k.close_time)?,
                    is_closed: k.is_closed,
                })
            }
        };
        Ok(event)
    }

    fn mini_ticker(&mut self, msg: MiniTickerMessage) -> TickerEvent {
        let (change, percent) = match self.last_prices.get(&msg.symbol) {
            Some(previous) if !previous.is_zero() => change_since(*previous, msg.close)
                .unwrap_or_else(|| {
                    tracing::debug!(symbol = %msg.symbol, "Price change out of decimal range");
                    (Decimal::ZERO, Decimal::ZERO)
                }),
            _ => (Decimal::ZERO, Decimal::ZERO),
        };
        self.remember_price(&msg.symbol, msg.close);

        TickerEvent {
            symbol: msg.symbol,
            price: msg.close,
            price_change: change,
            price_change_percent: percent,
            high_24h: msg.high,
            low_24h: msg.low,
            volume_24h: msg.volume,
            quote_volume_24h: msg.quote_volume,
            timestamp: Utc::now(),
        }
    }

    fn remember_price(&mut self, symbol: &str, price: Decimal) {
        if let Some(slot) = self.last_prices.get_mut(symbol) {
            *slot = price;
        } else if self.last_prices.len() < self.max_symbols {
            self.last_prices.insert(symbol.to_string(), price);
        }
    }

    /// Last price seen for `symbol`.
    #[must_use]
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.last_prices.get(symbol).copied()
    }
}

/// Absolute and percent change, or `None` if either overflows.
fn change_since(previous: Decimal, current: Decimal) -> Option<(Decimal, Decimal)> {
    let change = current.checked_sub(previous)?;
    let percent = change
        .checked_div(previous)?
        .checked_mul(Decimal::ONE_HUNDRED)?
        .round_dp(8);
    Some((change, percent))
}

fn from_payload<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::InvalidPayload(e.to_string()))
}

fn epoch(millis: i64) -> Result<DateTime<Utc>, CodecError> {
    from_epoch_millis(millis)
        .ok_or_else(|| CodecError::InvalidPayload(format!("timestamp out of range: {millis}")))
}

fn drop_payload(reason: DropReason, detail: &str, stream: Option<&str>) {
    tracing::warn!(reason = reason.as_str(), stream = ?stream, detail, "Dropping upstream payload");
    metrics::record_dropped_payload(reason);
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::domain::market::EventKind;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn mini(symbol: &str, close: &str) -> String {
        format!(
            r#"{{"e":"24hrMiniTicker","E":1,"s":"{symbol}","c":"{close}","o":"1","h":"2","l":"0.5","v":"10","q":"20"}}"#
        )
    }

    #[test]
    fn mini_ticker_array_in_order() {
        let mut decoder = FrameDecoder::default();
        let frame = format!("[{},{}]", mini("BTCUSDT", "100"), mini("ETHUSDT", "10"));

        let events = decoder.decode(&frame).unwrap();
        let symbols: Vec<_> = events.iter().map(NormalizedEvent::symbol).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!(events.iter().all(|e| e.kind() == EventKind::Ticker));
    }

    #[test]
    fn mini_ticker_change_from_last_price() {
        let mut decoder = FrameDecoder::default();

        let first = decoder.decode(&mini("BTCUSDT", "100")).unwrap();
        let NormalizedEvent::Ticker(t) = &first[0] else {
            panic!("expected ticker");
        };
        assert_eq!(t.price_change, Decimal::ZERO);
        assert_eq!(t.price_change_percent, Decimal::ZERO);

        let second = decoder.decode(&mini("BTCUSDT", "110")).unwrap();
        let NormalizedEvent::Ticker(t) = &second[0] else {
            panic!("expected ticker");
        };
        assert_eq!(t.price, dec("110"));
        assert_eq!(t.price_change, dec("10"));
        assert_eq!(t.price_change_percent, dec("10"));
        assert_eq!(decoder.last_price("BTCUSDT"), Some(dec("110")));
    }

    #[test]
    fn extreme_price_jump_reports_zero_change() {
        let mut decoder = FrameDecoder::default();
        decoder.decode(&mini("XUSDT", "0.00000001")).unwrap();

        let events = decoder
            .decode(&mini("XUSDT", "1000000000000000000000"))
            .unwrap();
        let NormalizedEvent::Ticker(t) = &events[0] else {
            panic!("expected ticker");
        };
        assert_eq!(t.price, dec("1000000000000000000000"));
        assert_eq!(t.price_change, Decimal::ZERO);
        assert_eq!(t.price_change_percent, Decimal::ZERO);

        let events = decoder.decode(&mini("XUSDT", "1100000000000000000000")).unwrap();
        let NormalizedEvent::Ticker(t) = &events[0] else {
            panic!("expected ticker");
        };
        assert_eq!(t.price_change_percent, dec("10"));
    }

    #[test]
    fn combined_envelope_uses_stream_suffix() {
        let mut decoder = FrameDecoder::default();
        let frame = r#"{"stream":"btcusdt@trade","data":{"s":"BTCUSDT","t":7,"p":"43000.5","q":"0.01","T":1700000000000,"m":true}}"#;

        let events = decoder.decode(frame).unwrap();
        match &events[..] {
            [NormalizedEvent::Trade(t)] => {
                assert_eq!(t.trade_id, 7);
                assert_eq!(t.side, TradeSide::Sell);
                assert_eq!(t.price, dec("43000.5"));
                assert_eq!(t.trade_time.timestamp_millis(), 1_700_000_000_000);
                assert!(t.timestamp > t.trade_time);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn envelope_around_array() {
        let mut decoder = FrameDecoder::default();
        let frame = format!(
            r#"{{"stream":"!miniTicker@arr","data":[{},{}]}}"#,
            mini("AAAUSDT", "1"),
            mini("BBBUSDT", "2")
        );
        assert_eq!(decoder.decode(&frame).unwrap().len(), 2);
    }

    #[test]
    fn agg_trade_uses_aggregate_id() {
        let mut decoder = FrameDecoder::default();
        let frame = r#"{"e":"aggTrade","s":"ETHUSDT","a":99,"p":"2000","q":"1","T":1700000000000,"m":false}"#;
        let events = decoder.decode(frame).unwrap();
        let NormalizedEvent::Trade(t) = &events[0] else {
            panic!("expected trade");
        };
        assert_eq!(t.trade_id, 99);
        assert_eq!(t.side, TradeSide::Buy);
    }

    #[test]
    fn full_ticker_keeps_exchange_change() {
        let mut decoder = FrameDecoder::default();
        let frame = r#"{"e":"24hrTicker","s":"BTCUSDT","p":"-5.5","P":"-0.01","c":"43250.1","h":"44000","l":"42000","v":"100","q":"4300000"}"#;
        let events = decoder.decode(frame).unwrap();
        let NormalizedEvent::Ticker(t) = &events[0] else {
            panic!("expected ticker");
        };
        assert_eq!(t.price_change, dec("-5.5"));
        assert_eq!(t.price_change_percent, dec("-0.01"));
        assert_eq!(t.quote_volume_24h, dec("4300000"));
    }

    #[test]
    fn kline_fields() {
        let mut decoder = FrameDecoder::default();
        let frame = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","o":"1","c":"2","h":"3","l":"0.5","v":"42","x":true}}}"#;
        let events = decoder.decode(frame).unwrap();
        let NormalizedEvent::Kline(k) = &events[0] else {
            panic!("expected kline");
        };
        assert_eq!(k.interval, "1m");
        assert_eq!(k.high, dec("3"));
        assert!(k.is_closed);
        assert_eq!(k.open_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn non_object_payloads_dropped() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.decode("42").unwrap().is_empty());
        assert!(decoder.decode(r#"["x", null, 1]"#).unwrap().is_empty());

        let frame = format!(r#"["junk",{}]"#, mini("BTCUSDT", "1"));
        assert_eq!(decoder.decode(&frame).unwrap().len(), 1);
    }

    #[test]
    fn malformed_element_does_not_abort_frame() {
        let mut decoder = FrameDecoder::default();
        let frame = format!(
            r#"[{{"e":"24hrMiniTicker","s":"BAD","c":"nope"}},{}]"#,
            mini("ETHUSDT", "5")
        );
        let events = decoder.decode(&frame).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol(), "ETHUSDT");
    }

    #[test]
    fn control_reply_ignored() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.decode(r#"{"result":null,"id":1}"#).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_error() {
        let mut decoder = FrameDecoder::default();
        assert!(matches!(decoder.decode("{oops"), Err(CodecError::Json(_))));
    }

    #[test]
    fn price_memory_is_bounded() {
        let mut decoder = FrameDecoder::new(1);
        decoder.decode(&mini("AAAUSDT", "1")).unwrap();
        decoder.decode(&mini("BBBUSDT", "2")).unwrap();
        assert_eq!(decoder.last_price("AAAUSDT"), Some(Decimal::ONE));
        assert_eq!(decoder.last_price("BBBUSDT"), None);
    }
}
