//! Upstream Reconnect Integration Tests
//!
//! Runs the stream client against a local WebSocket server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;

use market_stream_hub::{
    ConnectionState, EventKind, FnHandler, ReconnectConfig, StreamClient, StreamClientConfig,
};

/// What the fake exchange does with each accepted connection.
#[derive(Clone, Copy)]
enum Script {
    /// Send one mini ticker, then close.
    SendAndClose(&'static str),
    /// Send one mini ticker, then hold the connection open.
    SendAndHold(&'static str),
}

/// Accepts connections and reports each request URI.
async fn fake_exchange(scripts: Vec<Script>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for script in scripts {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let uri_tx = uri_tx.clone();
            let callback = move |request: &Request, response: Response| {
                let _ = uri_tx.send(request.uri().to_string());
                Ok(response)
            };
            let mut ws = accept_hdr_async(stream, callback).await.unwrap();

            let (symbol, hold) = match script {
                Script::SendAndClose(symbol) => (symbol, false),
                Script::SendAndHold(symbol) => (symbol, true),
            };
            let frame = format!(
                r#"{{"e":"24hrMiniTicker","E":1,"s":"{symbol}","c":"1","o":"1","h":"1","l":"1","v":"1","q":"1"}}"#
            );
            ws.send(Message::text(frame)).await.unwrap();

            if hold {
                tokio::spawn(async move { while ws.next().await.is_some() {} });
            } else {
                let _ = ws.close(None).await;
            }
        }
    });

    (format!("ws://{addr}"), uri_rx)
}

fn client(base_url: String, cancel: CancellationToken) -> Arc<StreamClient> {
    Arc::new(StreamClient::new(
        StreamClientConfig {
            base_url,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_millis(200),
            ..StreamClientConfig::default()
        },
        cancel,
    ))
}

fn record_symbols(client: &StreamClient) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.on(
        EventKind::Ticker,
        FnHandler::shared(move |event| {
            sink.lock().push(event.symbol().to_string());
            Ok(())
        }),
    );
    seen
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn reconnects_after_server_close() {
    let (url, mut uris) = fake_exchange(vec![
        Script::SendAndClose("BTCUSDT"),
        Script::SendAndHold("ETHUSDT"),
    ])
    .await;
    let cancel = CancellationToken::new();
    let client = client(url, cancel.clone());
    let seen = record_symbols(&client);

    let task = tokio::spawn(Arc::clone(&client).run());

    wait_until(|| seen.lock().len() == 2).await;
    assert_eq!(*seen.lock(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    assert!(client.stats().reconnects >= 1);
    wait_until(|| client.state() == ConnectionState::Connected).await;

    let first = uris.recv().await.unwrap();
    assert!(first.contains("!miniTicker@arr"));

    client.stop();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn subscription_change_reconnects_with_new_streams() {
    let (url, mut uris) = fake_exchange(vec![
        Script::SendAndHold("BTCUSDT"),
        Script::SendAndHold("BTCUSDT"),
    ])
    .await;
    let cancel = CancellationToken::new();
    let client = client(url, cancel.clone());
    client.subscribe_ticker("BTCUSDT").unwrap();
    let seen = record_symbols(&client);

    let task = tokio::spawn(Arc::clone(&client).run());

    let first = timeout(Duration::from_secs(2), uris.recv()).await.unwrap().unwrap();
    assert!(first.contains("btcusdt@ticker"));
    wait_until(|| seen.lock().len() == 1).await;

    client.subscribe_kline("ETHUSDT", "1m").unwrap();

    let second = timeout(Duration::from_secs(2), uris.recv()).await.unwrap().unwrap();
    assert!(second.contains("btcusdt@ticker"));
    assert!(second.contains("ethusdt@kline_1m"));

    cancel.cancel();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn unreachable_upstream_keeps_retrying_until_stopped() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(format!("ws://{addr}"), CancellationToken::new());
    let task = tokio::spawn(Arc::clone(&client).run());

    wait_until(|| client.stats().reconnects >= 2).await;
    assert_ne!(client.state(), ConnectionState::Connected);

    client.stop();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}
