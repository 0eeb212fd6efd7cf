//! Pull queues: bounded per-consumer buffers for polling-style delivery.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Identifier of a pull queue within the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PullQueueId(pub(super) u64);

impl std::fmt::Display for PullQueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pull-{}", self.0)
    }
}

/// Result of offering a message to a pull queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Message buffered.
    Accepted,
    /// Queue full; message discarded.
    Dropped,
    /// Consumer went away.
    Closed,
}

/// Producer side held by the hub.
#[derive(Debug, Clone)]
pub(super) struct PullSender(mpsc::Sender<Arc<str>>);

impl PullSender {
    /// Offer without waiting; a full queue drops the newest message.
    pub(super) fn enqueue(&self, message: &Arc<str>) -> Enqueue {
        match self.0.try_send(Arc::clone(message)) {
            Ok(()) => Enqueue::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }
}

/// Consumer handle returned by
/// [`BroadcastHub::create_pull_queue`](super::BroadcastHub::create_pull_queue).
///
/// Dropping the handle is enough to detach; the hub removes closed queues
/// on the next broadcast.
#[derive(Debug)]
pub struct PullQueue {
    id: PullQueueId,
    channel: String,
    rx: mpsc::Receiver<Arc<str>>,
}

impl PullQueue {
    pub(super) fn new(id: PullQueueId, channel: String, capacity: usize) -> (Self, PullSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, channel, rx }, PullSender(tx))
    }

    /// Queue identifier, used with `remove_pull_queue`.
    #[must_use]
    pub const fn id(&self) -> PullQueueId {
        self.id
    }

    /// Channel this queue is attached to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message. `None` once the hub released the queue.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    /// Next buffered message, if any.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }

    /// Take everything currently buffered.
    pub fn drain(&mut self) -> Vec<Arc<str>> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Convert into a `Stream` of messages.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<Arc<str>> {
        ReceiverStream::new(self.rx)
    }
}
