//! `GET /ws` push subscribers.
//!
//! Channels can be given up front (`/ws?channels=ticker,trade:BTCUSDT`) and
//! changed later with client messages:
//!
//! ```text
//! {"action":"subscribe","channel":"ticker:BTCUSDT"}
//! {"action":"unsubscribe","channel":"trade"}
//! {"action":"ping"}
//! ```

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::ServerState;
use super::connection::AxumPushConnection;
use crate::application::ports::{PushConnection, SendError};
use crate::domain::market::NormalizedEvent;

/// Query parameters for the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Comma-separated channel names.
    pub channels: Option<String>,
}

/// Messages accepted from a subscriber.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

/// Control messages sent to a subscriber alongside market events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage<'a> {
    Subscribed { channel: &'a str },
    Unsubscribed { channel: &'a str },
    Pong { timestamp: i64 },
    Error { message: String },
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    let channels = split_channels(params.channels.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, channels))
}

fn split_channels(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(ToString::to_string)
        .collect()
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, channels: Vec<String>) {
    let (sink, mut stream) = socket.split();
    let connection = AxumPushConnection::spawn(sink, state.outbound_buffer);
    let id = connection.id();
    let shared: Arc<dyn PushConnection> = Arc::new(connection.clone());
    tracing::info!(connection = %id, channels = ?channels, "Push subscriber connected");

    for channel in &channels {
        subscribe(&state, &shared, channel).await;
    }

    loop {
        tokio::select! {
            () = connection.closed().cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &shared, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection = %id, error = %e, "WebSocket read failed");
                    break;
                }
            }
        }
    }

    let removed = state.hub.remove_connection(id).await;
    shared.close().await;
    tracing::info!(connection = %id, channels = removed, "Push subscriber disconnected");
}

async fn handle_client_message(state: &ServerState, connection: &Arc<dyn PushConnection>, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { channel }) => subscribe(state, connection, &channel).await,
        Ok(ClientMessage::Unsubscribe { channel }) => {
            state.hub.unsubscribe(connection.id(), &channel).await;
            reply(state, connection, &ControlMessage::Unsubscribed { channel: &channel }).await;
        }
        Ok(ClientMessage::Ping) => {
            reply(
                state,
                connection,
                &ControlMessage::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                },
            )
            .await;
        }
        Err(e) => {
            reply(
                state,
                connection,
                &ControlMessage::Error {
                    message: format!("invalid message: {e}"),
                },
            )
            .await;
        }
    }
}

async fn subscribe(state: &ServerState, connection: &Arc<dyn PushConnection>, channel: &str) {
    if let Err(e) = state.hub.subscribe(Arc::clone(connection), channel).await {
        tracing::warn!(connection = %connection.id(), channel = %channel, error = %e, "Subscribe rejected");
        reply(
            state,
            connection,
            &ControlMessage::Error {
                message: e.to_string(),
            },
        )
        .await;
        return;
    }

    reply(state, connection, &ControlMessage::Subscribed { channel }).await;
    if let Some(snapshot) = state.ticker_snapshot(channel) {
        send_or_close(state, connection, &snapshot).await;
    }
}

async fn reply(
    state: &ServerState,
    connection: &Arc<dyn PushConnection>,
    message: &ControlMessage<'_>,
) {
    if let Ok(text) = serde_json::to_string(message) {
        send_or_close(state, connection, &text).await;
    }
}

/// Direct write bounded by the hub's send timeout; a failed write closes
/// the connection, which ends its read loop.
async fn send_or_close(state: &ServerState, connection: &Arc<dyn PushConnection>, text: &str) {
    let limit = state.hub.config().send_timeout;
    let error = match tokio::time::timeout(limit, connection.send(text)).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(_) => SendError::Timeout,
    };
    tracing::debug!(connection = %connection.id(), error = %error, "Direct write failed, closing");
    connection.close().await;
}

impl ServerState {
    /// Cached ticker for a `ticker:<SYMBOL>` channel, serialized like a live event.
    pub(super) fn ticker_snapshot(&self, channel: &str) -> Option<String> {
        let symbol = channel.strip_prefix("ticker:")?;
        let ticker = self.client.ticker(symbol)?;
        serde_json::to_string(&NormalizedEvent::Ticker((*ticker).clone())).ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::application::ports::ConnectionId;
    use crate::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
    use crate::infrastructure::upstream::{StreamClient, StreamClientConfig};

    /// Peer whose writes never complete.
    struct StuckPeer {
        id: ConnectionId,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PushConnection for StuckPeer {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, _text: &str) -> Result<(), SendError> {
            std::future::pending().await
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn state(send_timeout: Duration) -> ServerState {
        let hub = Arc::new(BroadcastHub::new(BroadcastConfig {
            send_timeout,
            ..BroadcastConfig::default()
        }));
        let client = Arc::new(StreamClient::new(
            StreamClientConfig::default(),
            CancellationToken::new(),
        ));
        ServerState::new("test", hub, client)
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_reply_closes_connection() {
        let state = state(Duration::from_millis(50));
        let peer = Arc::new(StuckPeer {
            id: ConnectionId::new(),
            closed: AtomicBool::new(false),
        });
        let connection: Arc<dyn PushConnection> = peer.clone();
        let started = tokio::time::Instant::now();

        handle_client_message(&state, &connection, r#"{"action":"ping"}"#).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(peer.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_subscribe_ack_closes_connection() {
        let state = state(Duration::from_millis(50));
        let peer = Arc::new(StuckPeer {
            id: ConnectionId::new(),
            closed: AtomicBool::new(false),
        });
        let connection: Arc<dyn PushConnection> = peer.clone();

        subscribe(&state, &connection, "trade").await;

        assert!(peer.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn channels_are_split_and_trimmed() {
        assert_eq!(
            split_channels(Some("ticker, trade:BTCUSDT,,")),
            vec!["ticker".to_string(), "trade:BTCUSDT".to_string()]
        );
        assert!(split_channels(None).is_empty());
    }

    #[test]
    fn client_messages_parse() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"action":"subscribe","channel":"trade"}"#),
            Ok(ClientMessage::Subscribe { channel }) if channel == "trade"
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"action":"ping"}"#),
            Ok(ClientMessage::Ping)
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"dance"}"#).is_err());
    }

    #[test]
    fn control_messages_are_tagged() {
        let text = serde_json::to_string(&ControlMessage::Subscribed { channel: "kline" }).unwrap();
        assert_eq!(text, r#"{"type":"subscribed","channel":"kline"}"#);
    }
}
