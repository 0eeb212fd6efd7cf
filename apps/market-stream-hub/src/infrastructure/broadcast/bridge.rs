//! Upstream-to-hub bridge.

use std::sync::Arc;

use async_trait::async_trait;

use super::hub::{BroadcastHub, HubError};
use crate::application::ports::{EventHandler, HandlerError};
use crate::domain::market::NormalizedEvent;

/// Publishes each normalized event on its kind channel (`ticker`, `trade`,
/// `kline`) and on its symbol channel (`ticker:BTCUSDT`, `kline:BTCUSDT:1m`).
#[derive(Debug, Clone)]
pub struct MarketEventBridge {
    hub: Arc<BroadcastHub>,
}

impl MarketEventBridge {
    /// Create a bridge publishing to `hub`.
    #[must_use]
    pub const fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }

    /// Create a bridge ready to register with the dispatcher.
    #[must_use]
    pub fn shared(hub: Arc<BroadcastHub>) -> Arc<dyn EventHandler> {
        Arc::new(Self::new(hub))
    }
}

#[async_trait]
impl EventHandler for MarketEventBridge {
    async fn handle(&self, event: &NormalizedEvent) -> Result<(), HandlerError> {
        let payload: Arc<str> = serde_json::to_string(event)
            .map_err(|e| HandlerError::new(format!("serialize {}: {e}", event.kind())))?
            .into();

        for channel in [event.kind().as_str().to_string(), event.symbol_channel()] {
            match self.hub.broadcast_text(&channel, Arc::clone(&payload)).await {
                Ok(_) => {}
                Err(HubError::Stopped) => return Ok(()),
                Err(e) => return Err(HandlerError::new(e.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::Value;

    use super::*;
    use crate::domain::market::{KlineEvent, TradeEvent, TradeSide};
    use crate::infrastructure::broadcast::BroadcastConfig;

    #[tokio::test]
    async fn publishes_on_kind_and_symbol_channels() {
        let hub = Arc::new(BroadcastHub::new(BroadcastConfig::default()));
        let mut all = hub.create_pull_queue("trade").await.unwrap();
        let mut btc = hub.create_pull_queue("trade:BTCUSDT").await.unwrap();
        let mut eth = hub.create_pull_queue("trade:ETHUSDT").await.unwrap();

        let bridge = MarketEventBridge::new(Arc::clone(&hub));
        let event = NormalizedEvent::Trade(TradeEvent {
            symbol: "BTCUSDT".to_string(),
            trade_id: 7,
            price: Decimal::new(50_000, 0),
            quantity: Decimal::new(1, 2),
            side: TradeSide::Sell,
            trade_time: Utc::now(),
            timestamp: Utc::now(),
        });
        bridge.handle(&event).await.unwrap();

        let message = all.try_recv().unwrap();
        assert_eq!(btc.try_recv().as_deref(), Some(&*message));
        assert!(eth.try_recv().is_none());

        let value: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "trade");
        assert_eq!(value["data"]["symbol"], "BTCUSDT");
    }

    #[tokio::test]
    async fn kline_symbol_channel_includes_interval() {
        let hub = Arc::new(BroadcastHub::new(BroadcastConfig::default()));
        let mut queue = hub.create_pull_queue("kline:ETHUSDT:5m").await.unwrap();

        let now = Utc::now();
        let event = NormalizedEvent::Kline(KlineEvent {
            symbol: "ETHUSDT".to_string(),
            interval: "5m".to_string(),
            open_time: now,
            open: Decimal::ONE,
            high: Decimal::TWO,
            low: Decimal::ONE,
            close: Decimal::TWO,
            volume: Decimal::TEN,
            close_time: now,
            is_closed: false,
        });
        MarketEventBridge::new(Arc::clone(&hub)).handle(&event).await.unwrap();

        assert!(queue.try_recv().is_some());
    }

    #[tokio::test]
    async fn stopped_hub_is_not_a_handler_failure() {
        let hub = Arc::new(BroadcastHub::new(BroadcastConfig::default()));
        hub.stop().await;
        let event = NormalizedEvent::Trade(TradeEvent {
            symbol: "BTCUSDT".to_string(),
            trade_id: 1,
            price: Decimal::ONE,
            quantity: Decimal::ONE,
            side: TradeSide::Buy,
            trade_time: Utc::now(),
            timestamp: Utc::now(),
        });
        assert!(MarketEventBridge::new(hub).handle(&event).await.is_ok());
    }
}
