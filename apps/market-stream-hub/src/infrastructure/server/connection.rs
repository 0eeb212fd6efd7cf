//! WebSocket push connection backed by a writer task.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConnectionId, PushConnection, SendError};

/// Outbound frames buffered per connection before sends start to wait.
pub const OUTBOUND_BUFFER: usize = 256;

/// [`PushConnection`] over an axum WebSocket.
///
/// Sends enqueue onto a bounded channel drained by a writer task; a full
/// buffer makes `send` wait, so the hub's send timeout applies to slow
/// peers.
#[derive(Debug, Clone)]
pub struct AxumPushConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl AxumPushConnection {
    /// Wrap the write half of a socket and spawn its writer task.
    #[must_use]
    pub fn spawn(sink: SplitSink<WebSocket, Message>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let closed = CancellationToken::new();
        let id = ConnectionId::new();
        tokio::spawn(write_loop(id, sink, rx, closed.clone()));
        Self { id, tx, closed }
    }

    /// Fires once the connection is closed from either side.
    #[must_use]
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

#[async_trait]
impl PushConnection for AxumPushConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, text: &str) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx
            .send(Message::text(text))
            .await
            .map_err(|_| SendError::Closed)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(connection = %id, error = %e, "WebSocket write failed");
                    break;
                }
            }
        }
    }
    closed.cancel();
    let _ = sink.close().await;
    tracing::debug!(connection = %id, "WebSocket writer stopped");
}
