//! Broadcast Fan-out Integration Tests
//!
//! Exercises the hub through the HTTP server: WebSocket push subscribers,
//! SSE pull subscribers and the status endpoints.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use market_stream_hub::{
    BroadcastConfig, BroadcastHub, HttpServer, ServerState, StreamClient, StreamClientConfig,
    TickerEvent,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    client: Arc<StreamClient>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start() -> Harness {
    let hub = Arc::new(BroadcastHub::new(BroadcastConfig::default()));
    let client = Arc::new(StreamClient::new(
        StreamClientConfig::default(),
        CancellationToken::new(),
    ));
    let cancel = CancellationToken::new();

    let state = Arc::new(ServerState::new("test", Arc::clone(&hub), Arc::clone(&client)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(addr.to_string(), state, cancel.clone());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    Harness {
        addr,
        hub,
        client,
        cancel,
    }
}

async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();
    socket
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for<F>(hub: &BroadcastHub, predicate: F)
where
    F: Fn(&market_stream_hub::HubStatus) -> bool,
{
    for _ in 0..100 {
        if predicate(&hub.status().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub never reached expected state");
}

fn ticker(symbol: &str, price: i64) -> TickerEvent {
    TickerEvent {
        symbol: symbol.to_string(),
        price: Decimal::from(price),
        price_change: Decimal::ZERO,
        price_change_percent: Decimal::ZERO,
        high_24h: Decimal::from(price),
        low_24h: Decimal::from(price),
        volume_24h: Decimal::ONE,
        quote_volume_24h: Decimal::from(price),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn websocket_subscriber_receives_channel_broadcasts() {
    let harness = start().await;
    let mut socket = connect(harness.addr, "?channels=trade,kline").await;

    assert_eq!(next_json(&mut socket).await, json!({"type":"subscribed","channel":"trade"}));
    assert_eq!(next_json(&mut socket).await, json!({"type":"subscribed","channel":"kline"}));

    let report = harness.hub.broadcast("trade", &json!({"n": 1})).await.unwrap();
    assert_eq!(report.delivered, 1);
    harness.hub.broadcast("ticker", &json!({"n": 2})).await.unwrap();
    harness.hub.broadcast("kline", &json!({"n": 3})).await.unwrap();

    assert_eq!(next_json(&mut socket).await, json!({"n": 1}));
    assert_eq!(next_json(&mut socket).await, json!({"n": 3}));
}

#[tokio::test]
async fn subscribe_action_sends_cached_ticker_snapshot() {
    let harness = start().await;
    harness.client.seed_tickers([ticker("BTCUSDT", 43_000)]);
    let mut socket = connect(harness.addr, "").await;

    socket
        .send(Message::text(r#"{"action":"subscribe","channel":"ticker:BTCUSDT"}"#))
        .await
        .unwrap();

    assert_eq!(
        next_json(&mut socket).await,
        json!({"type":"subscribed","channel":"ticker:BTCUSDT"})
    );
    let snapshot = next_json(&mut socket).await;
    assert_eq!(snapshot["type"], "ticker");
    assert_eq!(snapshot["data"]["symbol"], "BTCUSDT");
    assert_eq!(snapshot["data"]["price"], "43000");
}

#[tokio::test]
async fn ping_unsubscribe_and_invalid_actions() {
    let harness = start().await;
    let mut socket = connect(harness.addr, "?channels=trade").await;
    next_json(&mut socket).await;

    socket.send(Message::text(r#"{"action":"ping"}"#)).await.unwrap();
    let pong = next_json(&mut socket).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());

    socket.send(Message::text("nonsense")).await.unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "error");

    socket
        .send(Message::text(r#"{"action":"unsubscribe","channel":"trade"}"#))
        .await
        .unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "unsubscribed");
    assert_eq!(harness.hub.status().await.total_channels, 0);
}

#[tokio::test]
async fn disconnect_removes_connection_from_every_channel() {
    let harness = start().await;
    let mut socket = connect(harness.addr, "?channels=trade,ticker").await;
    next_json(&mut socket).await;
    next_json(&mut socket).await;
    assert_eq!(harness.hub.status().await.total_push_connections, 1);

    socket.close(None).await.unwrap();
    drop(socket);

    wait_for(&harness.hub, |s| s.total_push_connections == 0 && s.total_channels == 0).await;
}

#[tokio::test]
async fn sse_subscriber_receives_broadcasts() {
    let harness = start().await;
    let mut response = reqwest::get(format!("http://{}/stream/trade:BTCUSDT", harness.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(harness.hub.status().await.total_pull_queues, 1);

    harness
        .hub
        .broadcast("trade:BTCUSDT", &json!({"price": "1"}))
        .await
        .unwrap();

    let mut body = String::new();
    while !body.contains(r#"{"price":"1"}"#) {
        let chunk = timeout(Duration::from_secs(5), response.chunk())
            .await
            .unwrap()
            .unwrap()
            .expect("stream ended");
        body.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(body.contains("data:"));
}

#[tokio::test]
async fn sse_rejected_after_hub_stop() {
    let harness = start().await;
    harness.hub.stop().await;

    let response = reqwest::get(format!("http://{}/stream/trade", harness.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn status_endpoints_report_hub_and_upstream() {
    let harness = start().await;
    let _queue = harness.hub.create_pull_queue("kline").await.unwrap();
    let base = format!("http://{}", harness.addr);

    let live = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(live.status(), 200);

    let ready = reqwest::get(format!("{base}/readyz")).await.unwrap();
    assert_eq!(ready.status(), 503);

    let health: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["upstream"], "disconnected");
    assert_eq!(health["pull_queues"], 1);

    let status: Value = reqwest::get(format!("{base}/status")).await.unwrap().json().await.unwrap();
    assert_eq!(status["hub"]["channels"]["kline"]["pull_queues"], 1);
    assert_eq!(status["upstream"]["state"], "disconnected");
}
