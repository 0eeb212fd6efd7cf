//! Per-kind event dispatch with failure isolation.
//!
//! Handlers are registered against an [`EventKind`] and receive every event
//! of that kind in registration order. A handler that returns an error or
//! panics is logged and skipped; the remaining handlers still run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::RwLock;

use crate::application::ports::EventHandler;
use crate::domain::market::{EventKind, NormalizedEvent};
use crate::infrastructure::metrics;

/// Registration handle returned by [`EventDispatcher::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type HandlerList = Vec<(HandlerId, Arc<dyn EventHandler>)>;

/// Handler registry keyed by event kind.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventKind, HandlerList>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventDispatcher")
            .field("handlers", &counts)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn on(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a registration. Returns `false` if it was not registered.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler of its kind.
    ///
    /// Returns the number of handlers that completed successfully.
    pub async fn dispatch(&self, event: &NormalizedEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may (un)register without deadlocking.
        let handlers: HandlerList = self.handlers.read().get(&kind).cloned().unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(kind = %kind, handler = id.0, error = %e, "Event handler failed");
                    metrics::record_handler_failure(kind);
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(kind = %kind, handler = id.0, panic = %message, "Event handler panicked");
                    metrics::record_handler_failure(kind);
                }
            }
        }

        metrics::record_event_dispatched(kind);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{FnHandler, HandlerError};
    use crate::domain::market::{TradeEvent, TradeSide};

    fn trade() -> NormalizedEvent {
        NormalizedEvent::Trade(TradeEvent {
            symbol: "BTCUSDT".to_string(),
            trade_id: 1,
            price: Decimal::ONE,
            quantity: Decimal::ONE,
            side: TradeSide::Buy,
            trade_time: Utc::now(),
            timestamp: Utc::now(),
        })
    }

    fn counter(count: &Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        let count = Arc::clone(count);
        FnHandler::shared(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn dispatches_only_to_matching_kind() {
        let dispatcher = EventDispatcher::new();
        let trades = Arc::new(AtomicUsize::new(0));
        let tickers = Arc::new(AtomicUsize::new(0));
        dispatcher.on(EventKind::Trade, counter(&trades));
        dispatcher.on(EventKind::Ticker, counter(&tickers));

        assert_eq!(dispatcher.dispatch(&trade()).await, 1);
        assert_eq!(trades.load(Ordering::SeqCst), 1);
        assert_eq!(tickers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.on(
            EventKind::Trade,
            FnHandler::shared(|_| Err(HandlerError::new("boom"))),
        );
        dispatcher.on(EventKind::Trade, FnHandler::shared(|_| panic!("handler bug")));
        dispatcher.on(EventKind::Trade, counter(&count));

        assert_eq!(dispatcher.dispatch(&trade()).await, 1);
        assert_eq!(dispatcher.dispatch(&trade()).await, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn off_removes_registration() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = dispatcher.on(EventKind::Trade, counter(&count));

        assert!(dispatcher.off(EventKind::Trade, id));
        assert!(!dispatcher.off(EventKind::Trade, id));
        assert_eq!(dispatcher.handler_count(EventKind::Trade), 0);

        assert_eq!(dispatcher.dispatch(&trade()).await, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
