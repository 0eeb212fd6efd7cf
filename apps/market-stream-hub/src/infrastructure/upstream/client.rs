//! Upstream Stream Client
//!
//! Maintains one multiplexed combined-stream WebSocket to the exchange.
//!
//! # Lifecycle
//!
//! ```text
//! DISCONNECTED ──▶ CONNECTING ──▶ CONNECTED ──▶ DISCONNECTED ──▶ …
//!        ▲               │                           │
//!        └── backoff ◀───┴────── error / close ◀─────┘
//!
//! stop() ──▶ STOPPED (terminal)
//! ```
//!
//! The stream list is rebuilt from the active [`SubscriptionSet`] on every
//! connect. Changing the set while connected ends the current session and
//! reconnects immediately with the new list. Reconnect delays follow
//! [`ReconnectPolicy`] and reset once a connection is established.
//!
//! Frames are decoded by [`FrameDecoder`]; tickers are cached per symbol and
//! every event is passed to the handlers registered for its kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{FutureExt, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::codec::FrameDecoder;
use super::dispatcher::{EventDispatcher, HandlerId};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::EventHandler;
use crate::domain::market::{EventKind, NormalizedEvent, TickerEvent};
use crate::domain::subscription::{Subscription, SubscriptionError, SubscriptionSet};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Error Type
// =============================================================================

/// Errors from a single upstream session.
#[derive(Debug, thiserror::Error)]
pub enum StreamClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Connect did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Invalid subscription.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

// =============================================================================
// Configuration and State
// =============================================================================

/// Configuration for the upstream client.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Stream host, e.g. `wss://stream.binance.com:9443`.
    pub base_url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Upper bound on cached ticker symbols.
    pub max_ticker_symbols: usize,
    /// Limit for establishing the WebSocket.
    pub connect_timeout: Duration,
    /// Limit for the close handshake on shutdown or resubscribe.
    pub close_timeout: Duration,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://stream.binance.com:9443".to_string(),
            reconnect: ReconnectConfig::default(),
            max_ticker_symbols: 5000,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Connection state of the upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; waiting to (re)connect.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Receiving frames.
    Connected,
    /// Stopped for good.
    Stopped,
}

impl ConnectionState {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stopped => "stopped",
        }
    }
}

/// Why a listen session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// No transport was supplied; nothing was read.
    NotConnected,
    /// The client is stopping.
    Stopped,
    /// The subscription set changed; reconnect with the new stream list.
    Resubscribe,
    /// The server closed the stream.
    Closed,
}

/// Snapshot of client counters.
#[derive(Debug, Clone, Serialize)]
pub struct StreamClientStats {
    /// Connection state.
    pub state: ConnectionState,
    /// Active stream names.
    pub streams: Vec<String>,
    /// Symbols in the ticker cache.
    pub cached_tickers: usize,
    /// Text frames received.
    pub frames_received: u64,
    /// Events decoded and dispatched.
    pub events_dispatched: u64,
    /// Reconnect attempts since start.
    pub reconnects: u64,
}

// =============================================================================
// Stream Client
// =============================================================================

/// Upstream combined-stream client.
pub struct StreamClient {
    config: StreamClientConfig,
    subscriptions: RwLock<SubscriptionSet>,
    state: RwLock<ConnectionState>,
    resubscribe: Notify,
    dispatcher: EventDispatcher,
    decoder: Mutex<FrameDecoder>,
    tickers: RwLock<HashMap<String, Arc<TickerEvent>>>,
    cancel: CancellationToken,
    frames_received: AtomicU64,
    events_dispatched: AtomicU64,
    reconnects: AtomicU64,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("base_url", &self.config.base_url)
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Create a client; call [`run`](Self::run) to start streaming.
    #[must_use]
    pub fn new(config: StreamClientConfig, cancel: CancellationToken) -> Self {
        let decoder = FrameDecoder::new(config.max_ticker_symbols);
        Self {
            config,
            subscriptions: RwLock::new(SubscriptionSet::new()),
            state: RwLock::new(ConnectionState::Disconnected),
            resubscribe: Notify::new(),
            dispatcher: EventDispatcher::new(),
            decoder: Mutex::new(decoder),
            tickers: RwLock::new(HashMap::new()),
            cancel,
            frames_received: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe to the 24h ticker for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] for an invalid symbol.
    pub fn subscribe_ticker(&self, symbol: &str) -> Result<bool, SubscriptionError> {
        Ok(self.subscribe(Subscription::ticker(symbol)?))
    }

    /// Subscribe to candlesticks for `symbol` at `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] for an invalid symbol or interval.
    pub fn subscribe_kline(&self, symbol: &str, interval: &str) -> Result<bool, SubscriptionError> {
        Ok(self.subscribe(Subscription::kline(symbol, interval)?))
    }

    /// Subscribe to raw trades for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] for an invalid symbol.
    pub fn subscribe_trade(&self, symbol: &str) -> Result<bool, SubscriptionError> {
        Ok(self.subscribe(Subscription::trade(symbol)?))
    }

    /// Subscribe to aggregated trades for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] for an invalid symbol.
    pub fn subscribe_agg_trade(&self, symbol: &str) -> Result<bool, SubscriptionError> {
        Ok(self.subscribe(Subscription::agg_trade(symbol)?))
    }

    /// Add a subscription. Returns `false` if it was already active.
    pub fn subscribe(&self, subscription: Subscription) -> bool {
        let stream = subscription.stream_name();
        let added = self.subscriptions.write().insert(subscription);
        if added {
            tracing::info!(stream = %stream, "Added upstream subscription");
            self.resubscribe.notify_one();
        }
        added
    }

    /// Remove a subscription. Returns `false` if it was not active.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = self.subscriptions.write().remove(subscription);
        if removed {
            tracing::info!(stream = %subscription, "Removed upstream subscription");
            self.resubscribe.notify_one();
        }
        removed
    }

    /// Active subscriptions in stable order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// URL the next connect will use.
    #[must_use]
    pub fn stream_url(&self) -> String {
        self.subscriptions.read().stream_url(&self.config.base_url)
    }

    // -------------------------------------------------------------------------
    // Handlers and Cache
    // -------------------------------------------------------------------------

    /// Register a handler for events of `kind`.
    pub fn on(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.dispatcher.on(kind, handler)
    }

    /// Remove a handler registration.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.dispatcher.off(kind, id)
    }

    /// Last known ticker for `symbol`.
    #[must_use]
    pub fn ticker(&self, symbol: &str) -> Option<Arc<TickerEvent>> {
        self.tickers.read().get(&symbol.to_ascii_uppercase()).cloned()
    }

    /// Snapshot of every cached ticker.
    #[must_use]
    pub fn tickers(&self) -> HashMap<String, Arc<TickerEvent>> {
        self.tickers.read().clone()
    }

    /// Fill the cache for symbols that have no live ticker yet.
    ///
    /// Returns the number of entries added.
    pub fn seed_tickers(&self, tickers: impl IntoIterator<Item = TickerEvent>) -> usize {
        let mut cache = self.tickers.write();
        let mut added = 0;
        for ticker in tickers {
            if cache.len() >= self.config.max_ticker_symbols {
                break;
            }
            if !cache.contains_key(&ticker.symbol) {
                cache.insert(ticker.symbol.clone(), Arc::new(ticker));
                added += 1;
            }
        }
        added
    }

    fn cache_ticker(&self, ticker: &TickerEvent) {
        let mut cache = self.tickers.write();
        if cache.len() >= self.config.max_ticker_symbols && !cache.contains_key(&ticker.symbol) {
            tracing::debug!(symbol = %ticker.symbol, "Ticker cache full, not caching");
            return;
        }
        cache.insert(ticker.symbol.clone(), Arc::new(ticker.clone()));
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state == ConnectionState::Stopped || *state == next {
            return;
        }
        tracing::debug!(from = state.as_str(), to = next.as_str(), "Upstream state change");
        *state = next;
        drop(state);
        metrics::set_upstream_state(next);
    }

    /// Counters for status reporting.
    #[must_use]
    pub fn stats(&self) -> StreamClientStats {
        StreamClientStats {
            state: self.state(),
            streams: self.subscriptions.read().stream_names(),
            cached_tickers: self.tickers.read().len(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop streaming: closes the transport and prevents reconnects.
    pub fn stop(&self) {
        tracing::info!("Stopping upstream client");
        self.cancel.cancel();
        self.set_state(ConnectionState::Stopped);
    }

    // -------------------------------------------------------------------------
    // Run Loop
    // -------------------------------------------------------------------------

    /// Connect, listen and reconnect until stopped. Never returns an error.
    pub async fn run(self: Arc<Self>) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        while !self.cancel.is_cancelled() {
            let outcome = self.connect_and_listen(&mut policy).await;
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = match outcome {
                Ok(ListenOutcome::Resubscribe) => {
                    tracing::info!("Subscriptions changed, reconnecting with updated streams");
                    Duration::ZERO
                }
                Ok(outcome) => {
                    tracing::info!(outcome = ?outcome, "Upstream session ended");
                    policy.next_delay()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream connection error");
                    policy.next_delay()
                }
            };

            self.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();

            if delay.is_zero() {
                continue;
            }
            tracing::info!(
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis(),
                "Reconnecting to upstream stream"
            );
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Stopped);
        tracing::info!("Upstream client stopped");
    }

    async fn connect_and_listen(
        &self,
        policy: &mut ReconnectPolicy,
    ) -> Result<ListenOutcome, StreamClientError> {
        // Changes made before this snapshot are already in the URL.
        let _ = self.resubscribe.notified().now_or_never();
        let url = self.stream_url();

        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %url, "Connecting to upstream stream");

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let ws = tokio::select! {
            () = self.cancel.cancelled() => return Ok(ListenOutcome::Stopped),
            result = connect => match result {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(StreamClientError::ConnectTimeout(self.config.connect_timeout)),
            },
        };

        self.set_state(ConnectionState::Connected);
        policy.reset();
        tracing::info!("Upstream stream connected");

        let (mut write, mut read) = ws.split();
        let outcome = self.listen(Some(&mut read)).await;

        match tokio::time::timeout(self.config.close_timeout, write.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Close handshake failed"),
            Err(_) => tracing::debug!("Close handshake timed out"),
        }

        outcome
    }

    /// Read frames from `stream` until it ends, errors, the client stops or
    /// the subscription set changes. A missing stream returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StreamClientError::WebSocket`] on a transport error.
    pub async fn listen<S>(&self, stream: Option<S>) -> Result<ListenOutcome, StreamClientError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let Some(mut stream) = stream else {
            tracing::debug!("Listen called without a connection");
            return Ok(ListenOutcome::NotConnected);
        };

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(ListenOutcome::Stopped),
                () = self.resubscribe.notified() => return Ok(ListenOutcome::Resubscribe),
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(&text).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            self.handle_frame(text).await;
                        }
                        Err(_) => {
                            tracing::warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame");
                            metrics::record_dropped_payload(DropReason::InvalidJson);
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "Upstream sent close frame");
                        return Ok(ListenOutcome::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(ListenOutcome::Closed),
                },
            }
        }
    }

    /// Decode one text frame, update the ticker cache and dispatch.
    ///
    /// Returns the number of events dispatched.
    pub async fn handle_frame(&self, text: &str) -> usize {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame_received();

        let decoded = self.decoder.lock().decode(text);
        let events = match decoded {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable frame");
                metrics::record_dropped_payload(DropReason::InvalidJson);
                return 0;
            }
        };

        for event in &events {
            if let NormalizedEvent::Ticker(ticker) = event {
                self.cache_ticker(ticker);
            }
            self.dispatcher.dispatch(event).await;
        }

        let count = events.len();
        self.events_dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::FnHandler;
    use crate::domain::subscription::ALL_MINI_TICKERS;

    fn client() -> StreamClient {
        StreamClient::new(StreamClientConfig::default(), CancellationToken::new())
    }

    fn mini(symbol: &str, close: &str) -> String {
        format!(
            r#"{{"e":"24hrMiniTicker","E":1,"s":"{symbol}","c":"{close}","o":"1","h":"2","l":"0.5","v":"10","q":"20"}}"#
        )
    }

    fn recorder(seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn EventHandler> {
        let seen = Arc::clone(seen);
        FnHandler::shared(move |event| {
            seen.lock().push(event.symbol().to_string());
            Ok(())
        })
    }

    #[test]
    fn default_stream_is_all_mini_tickers() {
        let client = client();
        assert!(client.subscriptions().is_empty());
        assert!(client.stream_url().ends_with(ALL_MINI_TICKERS));
    }

    #[test]
    fn subscriptions_are_deduplicated() {
        let client = client();
        assert!(client.subscribe_ticker("btcusdt").unwrap());
        assert!(!client.subscribe_ticker("BTCUSDT").unwrap());
        assert!(client.subscribe_kline("BTCUSDT", "1m").unwrap());
        assert!(client.subscribe_trade("ETHUSDT").unwrap());
        assert!(client.subscribe_agg_trade("ETHUSDT").unwrap());
        assert_eq!(client.subscriptions().len(), 4);

        let url = client.stream_url();
        assert!(url.contains("btcusdt@kline_1m"));
        assert!(url.contains("ethusdt@aggTrade"));
    }

    #[test]
    fn unsubscribe_removes() {
        let client = client();
        client.subscribe_trade("BTCUSDT").unwrap();
        let sub = Subscription::trade("BTCUSDT").unwrap();
        assert!(client.unsubscribe(&sub));
        assert!(!client.unsubscribe(&sub));
    }

    #[tokio::test]
    async fn mini_ticker_array_dispatches_in_order_and_caches() {
        let client = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        client.on(EventKind::Ticker, recorder(&seen));

        let frame = format!("[{},{}]", mini("BTCUSDT", "100"), mini("ETHUSDT", "10"));
        assert_eq!(client.handle_frame(&frame).await, 2);

        assert_eq!(*seen.lock(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(client.ticker("btcusdt").unwrap().price, Decimal::from(100));
        assert_eq!(client.tickers().len(), 2);
    }

    #[tokio::test]
    async fn invalid_frames_are_dropped() {
        let client = client();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        client.on(
            EventKind::Ticker,
            FnHandler::shared(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert_eq!(client.handle_frame("not json").await, 0);
        assert_eq!(client.handle_frame(r#""a string""#).await, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(client.stats().frames_received, 2);
    }

    #[tokio::test]
    async fn listen_without_connection_is_noop() {
        let client = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        client.on(EventKind::Ticker, recorder(&seen));

        let outcome = client
            .listen(None::<futures::stream::Empty<Result<Message, tungstenite::Error>>>)
            .await
            .unwrap();

        assert_eq!(outcome, ListenOutcome::NotConnected);
        assert!(seen.lock().is_empty());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn listen_reads_until_close() {
        let client = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        client.on(EventKind::Ticker, recorder(&seen));

        let frames = vec![
            Ok(Message::text(mini("BTCUSDT", "1"))),
            Ok(Message::text("garbage")),
            Ok(Message::Ping(Vec::new().into())),
            Ok(Message::text(mini("ETHUSDT", "2"))),
            Ok(Message::Close(None)),
            Ok(Message::text(mini("SOLUSDT", "3"))),
        ];
        let outcome = client.listen(Some(futures::stream::iter(frames))).await.unwrap();

        assert_eq!(outcome, ListenOutcome::Closed);
        assert_eq!(*seen.lock(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[tokio::test]
    async fn listen_surfaces_transport_error() {
        let client = client();
        let frames = vec![Err(tungstenite::Error::ConnectionClosed)];
        let result = client.listen(Some(futures::stream::iter(frames))).await;
        assert!(matches!(result, Err(StreamClientError::WebSocket(_))));
    }

    #[tokio::test]
    async fn subscribe_while_listening_requests_resubscribe() {
        let client = Arc::new(client());
        let listener = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.listen(Some(futures::stream::pending())).await })
        };

        tokio::task::yield_now().await;
        client.subscribe_ticker("BTCUSDT").unwrap();

        let outcome = listener.await.unwrap().unwrap();
        assert_eq!(outcome, ListenOutcome::Resubscribe);
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let client = Arc::new(client());
        client.stop();
        assert_eq!(client.state(), ConnectionState::Stopped);

        Arc::clone(&client).run().await;
        assert_eq!(client.state(), ConnectionState::Stopped);

        let outcome = client
            .listen(Some(futures::stream::pending::<Result<Message, tungstenite::Error>>()))
            .await
            .unwrap();
        assert_eq!(outcome, ListenOutcome::Stopped);
    }

    #[test]
    fn seed_does_not_overwrite_live_tickers() {
        let client = client();
        let ticker = |price: i64| TickerEvent {
            symbol: "BTCUSDT".to_string(),
            price: Decimal::from(price),
            price_change: Decimal::ZERO,
            price_change_percent: Decimal::ZERO,
            high_24h: Decimal::ZERO,
            low_24h: Decimal::ZERO,
            volume_24h: Decimal::ZERO,
            quote_volume_24h: Decimal::ZERO,
            timestamp: chrono::Utc::now(),
        };

        client.cache_ticker(&ticker(100));
        assert_eq!(client.seed_tickers([ticker(1)]), 0);
        assert_eq!(client.ticker("BTCUSDT").unwrap().price, Decimal::from(100));
    }

    #[tokio::test]
    async fn ticker_cache_is_bounded() {
        let client = StreamClient::new(
            StreamClientConfig {
                max_ticker_symbols: 1,
                ..StreamClientConfig::default()
            },
            CancellationToken::new(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        client.on(EventKind::Ticker, recorder(&seen));

        client.handle_frame(&mini("AAAUSDT", "1")).await;
        client.handle_frame(&mini("BBBUSDT", "2")).await;

        assert_eq!(seen.lock().len(), 2);
        assert!(client.ticker("AAAUSDT").is_some());
        assert!(client.ticker("BBBUSDT").is_none());
    }
}
