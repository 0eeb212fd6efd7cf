//! Channel registry and fan-out.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::pull::{Enqueue, PullQueue, PullQueueId, PullSender};
use crate::application::ports::{ConnectionId, PushConnection, SendError};
use crate::infrastructure::metrics;

// =============================================================================
// Errors and Configuration
// =============================================================================

/// Errors returned by [`BroadcastHub`].
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub has been stopped.
    #[error("broadcast hub stopped")]
    Stopped,

    /// Creating the channel would exceed the registry bound.
    #[error("channel limit reached ({max})")]
    ChannelLimit {
        /// Configured maximum.
        max: usize,
    },

    /// Channel name was empty.
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    /// Payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Default pull-queue capacity.
    pub pull_queue_capacity: usize,
    /// Idle time after which a push connection gets a heartbeat.
    pub heartbeat_idle_timeout: Duration,
    /// How often idle connections are checked.
    pub heartbeat_interval: Duration,
    /// Limit for one push write.
    pub send_timeout: Duration,
    /// Limit for closing one connection.
    pub close_timeout: Duration,
    /// Upper bound on live channels.
    pub max_channels: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            pull_queue_capacity: 100,
            heartbeat_idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            max_channels: 10_000,
        }
    }
}

// =============================================================================
// Channel State
// =============================================================================

pub(super) struct PushEntry {
    pub(super) connection: Arc<dyn PushConnection>,
    pub(super) last_sent: Instant,
}

#[derive(Default)]
pub(super) struct Channel {
    pub(super) push: HashMap<ConnectionId, PushEntry>,
    pull: HashMap<PullQueueId, PullSender>,
    /// Set once the channel has been unlinked from the registry.
    closed: bool,
}

impl Channel {
    fn is_empty(&self) -> bool {
        self.push.is_empty() && self.pull.is_empty()
    }
}

type SharedChannel = Arc<Mutex<Channel>>;

/// Outcome of one [`BroadcastHub::broadcast`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Push connections and pull queues that accepted the message.
    pub delivered: usize,
    /// Push connections removed after a failed send.
    pub pruned: usize,
    /// Pull-queue deliveries dropped because the queue was full.
    pub dropped: usize,
}

/// Per-channel counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    /// Push connections.
    pub push_connections: usize,
    /// Pull queues.
    pub pull_queues: usize,
}

/// Hub-wide status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    /// Whether the hub is running.
    pub running: bool,
    /// Live channels.
    pub total_channels: usize,
    /// Distinct push connections.
    pub total_push_connections: usize,
    /// Pull queues.
    pub total_pull_queues: usize,
    /// Counts by channel name.
    pub channels: BTreeMap<String, ChannelStatus>,
    /// Broadcast calls.
    pub messages_broadcast: u64,
    /// Successful deliveries.
    pub messages_delivered: u64,
    /// Connections pruned after failures.
    pub connections_pruned: u64,
    /// Pull messages dropped on full queues.
    pub messages_dropped: u64,
    /// Heartbeats sent.
    pub heartbeats_sent: u64,
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Channel registry with push and pull fan-out.
///
/// Broadcasts on one channel are serialized by that channel's lock and reach
/// consumers in call order; different channels proceed independently. A
/// push connection whose send fails or times out is removed from every
/// channel and closed.
///
/// # Example
///
/// ```rust,ignore
/// let hub = Arc::new(BroadcastHub::new(BroadcastConfig::default()));
/// hub.start();
///
/// hub.subscribe(connection, "ticker:BTCUSDT").await?;
/// let mut queue = hub.create_pull_queue("trade").await?;
///
/// hub.broadcast("trade", &event).await?;
/// let message = queue.recv().await;
/// ```
pub struct BroadcastHub {
    pub(super) config: BroadcastConfig,
    pub(super) channels: RwLock<HashMap<String, SharedChannel>>,
    pub(super) cancel: CancellationToken,
    stopped: AtomicBool,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
    next_queue_id: AtomicU64,
    messages_broadcast: AtomicU64,
    messages_delivered: AtomicU64,
    connections_pruned: AtomicU64,
    messages_dropped: AtomicU64,
    pub(super) heartbeats_sent: AtomicU64,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("channels", &self.channels.read().len())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

impl BroadcastHub {
    /// Create a hub. Call [`start`](Self::start) to enable heartbeats.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            sweeper: parking_lot::Mutex::new(None),
            next_queue_id: AtomicU64::new(1),
            messages_broadcast: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            connections_pruned: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
        }
    }

    /// Create a hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Hub configuration.
    #[must_use]
    pub const fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Spawn the heartbeat sweeper. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(tokio::spawn(super::heartbeat::run(Arc::clone(self))));
            tracing::info!(
                idle_timeout_secs = self.config.heartbeat_idle_timeout.as_secs(),
                "Broadcast hub started"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    fn channel(&self, name: &str) -> Option<SharedChannel> {
        self.channels.read().get(name).cloned()
    }

    fn channel_or_create(&self, name: &str) -> Result<SharedChannel, HubError> {
        if name.trim().is_empty() {
            return Err(HubError::InvalidChannel(name.to_string()));
        }
        if let Some(channel) = self.channel(name) {
            return Ok(channel);
        }

        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(name) {
            return Ok(Arc::clone(channel));
        }
        if channels.len() >= self.config.max_channels {
            tracing::warn!(channel = %name, max = self.config.max_channels, "Channel limit reached");
            return Err(HubError::ChannelLimit {
                max: self.config.max_channels,
            });
        }

        let channel = SharedChannel::default();
        channels.insert(name.to_string(), Arc::clone(&channel));
        metrics::set_hub_channels(channels.len());
        tracing::debug!(channel = %name, "Channel created");
        Ok(channel)
    }

    /// Unlink `channel` if it has no consumers left. Caller holds its lock.
    fn remove_if_empty(&self, name: &str, shared: &SharedChannel, channel: &mut Channel) {
        if !channel.is_empty() || channel.closed {
            return;
        }
        let mut channels = self.channels.write();
        if channels.get(name).is_some_and(|c| Arc::ptr_eq(c, shared)) {
            channels.remove(name);
            channel.closed = true;
            metrics::set_hub_channels(channels.len());
            tracing::debug!(channel = %name, "Channel removed");
        }
    }

    fn snapshot(&self) -> Vec<(String, SharedChannel)> {
        self.channels
            .read()
            .iter()
            .map(|(name, channel)| (name.clone(), Arc::clone(channel)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Attach a push connection to `channel`, creating the channel if needed.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`], [`HubError::InvalidChannel`] or
    /// [`HubError::ChannelLimit`].
    pub async fn subscribe(
        &self,
        connection: Arc<dyn PushConnection>,
        channel: &str,
    ) -> Result<(), HubError> {
        loop {
            if self.is_stopped() {
                return Err(HubError::Stopped);
            }
            let shared = self.channel_or_create(channel)?;
            let mut guard = shared.lock().await;
            if guard.closed {
                continue;
            }

            let id = connection.id();
            guard.push.insert(
                id,
                PushEntry {
                    connection,
                    last_sent: Instant::now(),
                },
            );
            tracing::debug!(connection = %id, channel = %channel, "Push connection subscribed");
            return Ok(());
        }
    }

    /// Detach a push connection from `channel`. Idempotent.
    ///
    /// Returns `true` if the connection was attached.
    pub async fn unsubscribe(&self, connection_id: ConnectionId, channel: &str) -> bool {
        let Some(shared) = self.channel(channel) else {
            return false;
        };
        let mut guard = shared.lock().await;
        let removed = guard.push.remove(&connection_id).is_some();
        self.remove_if_empty(channel, &shared, &mut guard);
        if removed {
            tracing::debug!(connection = %connection_id, channel = %channel, "Push connection unsubscribed");
        }
        removed
    }

    /// Detach a push connection from every channel.
    ///
    /// Returns the number of channels it was removed from.
    pub async fn remove_connection(&self, connection_id: ConnectionId) -> usize {
        let mut removed = 0;
        for (name, shared) in self.snapshot() {
            let mut guard = shared.lock().await;
            if guard.push.remove(&connection_id).is_some() {
                removed += 1;
            }
            self.remove_if_empty(&name, &shared, &mut guard);
        }
        removed
    }

    /// Channels a push connection is attached to.
    pub async fn channels_of(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut names = Vec::new();
        for (name, shared) in self.snapshot() {
            if shared.lock().await.push.contains_key(&connection_id) {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Register a pull queue on `channel` with the default capacity.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn create_pull_queue(&self, channel: &str) -> Result<PullQueue, HubError> {
        self.create_pull_queue_with_capacity(channel, self.config.pull_queue_capacity)
            .await
    }

    /// Register a pull queue on `channel` holding at most `capacity` messages.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn create_pull_queue_with_capacity(
        &self,
        channel: &str,
        capacity: usize,
    ) -> Result<PullQueue, HubError> {
        let id = PullQueueId(self.next_queue_id.fetch_add(1, Ordering::Relaxed));
        loop {
            if self.is_stopped() {
                return Err(HubError::Stopped);
            }
            let shared = self.channel_or_create(channel)?;
            let mut guard = shared.lock().await;
            if guard.closed {
                continue;
            }

            let (queue, sender) = PullQueue::new(id, channel.to_string(), capacity);
            guard.pull.insert(id, sender);
            tracing::debug!(queue = %id, channel = %channel, capacity, "Pull queue created");
            return Ok(queue);
        }
    }

    /// Remove a pull queue. Idempotent.
    pub async fn remove_pull_queue(&self, queue_id: PullQueueId, channel: &str) -> bool {
        let Some(shared) = self.channel(channel) else {
            return false;
        };
        let mut guard = shared.lock().await;
        let removed = guard.pull.remove(&queue_id).is_some();
        self.remove_if_empty(channel, &shared, &mut guard);
        removed
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Serialize `message` once and deliver it to every consumer of `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] after [`stop`](Self::stop), or
    /// [`HubError::Serialize`]. Per-recipient failures are never errors.
    pub async fn broadcast<T>(&self, channel: &str, message: &T) -> Result<BroadcastReport, HubError>
    where
        T: Serialize + ?Sized,
    {
        let payload: Arc<str> = Arc::from(serde_json::to_string(message)?);
        self.broadcast_text(channel, payload).await
    }

    /// Deliver an already-serialized message to every consumer of `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] after [`stop`](Self::stop).
    pub async fn broadcast_text(
        &self,
        channel: &str,
        payload: Arc<str>,
    ) -> Result<BroadcastReport, HubError> {
        if self.is_stopped() {
            return Err(HubError::Stopped);
        }
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);

        let Some(shared) = self.channel(channel) else {
            return Ok(BroadcastReport::default());
        };

        let mut report = BroadcastReport::default();
        let mut failed: Vec<Arc<dyn PushConnection>> = Vec::new();
        {
            let mut guard = shared.lock().await;

            let sends = guard.push.iter().map(|(id, entry)| {
                let id = *id;
                let connection = Arc::clone(&entry.connection);
                let payload = Arc::clone(&payload);
                async move { (id, self.deliver(connection.as_ref(), &payload).await) }
            });
            let results = join_all(sends).await;

            let now = Instant::now();
            for (id, result) in results {
                match result {
                    Ok(()) => {
                        report.delivered += 1;
                        if let Some(entry) = guard.push.get_mut(&id) {
                            entry.last_sent = now;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(connection = %id, channel = %channel, error = %e, "Pruning push connection");
                        if let Some(entry) = guard.push.remove(&id) {
                            failed.push(entry.connection);
                        }
                    }
                }
            }

            let mut closed_queues = Vec::new();
            for (id, sender) in &guard.pull {
                match sender.enqueue(&payload) {
                    Enqueue::Accepted => report.delivered += 1,
                    Enqueue::Dropped => report.dropped += 1,
                    Enqueue::Closed => closed_queues.push(*id),
                }
            }
            for id in closed_queues {
                guard.pull.remove(&id);
                tracing::debug!(queue = %id, channel = %channel, "Removed closed pull queue");
            }

            self.remove_if_empty(channel, &shared, &mut guard);
        }

        report.pruned = failed.len();
        self.messages_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.messages_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        metrics::record_broadcast(channel, &report);

        if report.dropped > 0 {
            tracing::debug!(channel = %channel, dropped = report.dropped, "Pull queue full, dropped message");
        }
        for connection in failed {
            self.prune(connection).await;
        }

        Ok(report)
    }

    /// Write to one connection, bounded by the send timeout and shutdown.
    pub(super) async fn deliver(
        &self,
        connection: &dyn PushConnection,
        text: &str,
    ) -> Result<(), SendError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SendError::Stopped),
            result = tokio::time::timeout(self.config.send_timeout, connection.send(text)) => {
                result.unwrap_or(Err(SendError::Timeout))
            }
        }
    }

    /// Remove a dead connection everywhere and close it.
    pub(super) async fn prune(&self, connection: Arc<dyn PushConnection>) {
        let id = connection.id();
        self.remove_connection(id).await;
        self.connections_pruned.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_pruned();
        if tokio::time::timeout(self.config.close_timeout, connection.close())
            .await
            .is_err()
        {
            tracing::debug!(connection = %id, "Close timed out for pruned connection");
        }
        tracing::info!(connection = %id, "Pruned dead push connection");
    }

    // -------------------------------------------------------------------------
    // Status and Shutdown
    // -------------------------------------------------------------------------

    /// Total and per-channel counts.
    pub async fn status(&self) -> HubStatus {
        let mut status = HubStatus {
            running: !self.is_stopped(),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            connections_pruned: self.connections_pruned.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            ..HubStatus::default()
        };

        let mut connections = HashSet::new();
        for (name, shared) in self.snapshot() {
            let guard = shared.lock().await;
            if guard.closed {
                continue;
            }
            connections.extend(guard.push.keys().copied());
            status.total_pull_queues += guard.pull.len();
            status.channels.insert(
                name,
                ChannelStatus {
                    push_connections: guard.push.len(),
                    pull_queues: guard.pull.len(),
                },
            );
        }
        status.total_channels = status.channels.len();
        status.total_push_connections = connections.len();
        metrics::set_push_connections(connections.len());
        status
    }

    /// Stop the hub: fail pending sends, close every connection, release
    /// every pull queue and clear the registry.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Stopping broadcast hub");
        self.cancel.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            handle.abort();
        }

        let channels: Vec<SharedChannel> = self.channels.write().drain().map(|(_, c)| c).collect();
        metrics::set_hub_channels(0);

        let mut connections: HashMap<ConnectionId, Arc<dyn PushConnection>> = HashMap::new();
        for shared in channels {
            let mut guard = shared.lock().await;
            guard.closed = true;
            guard.pull.clear();
            for (id, entry) in guard.push.drain() {
                connections.entry(id).or_insert(entry.connection);
            }
        }

        let closes = connections.into_values().map(|connection| async move {
            let _ = tokio::time::timeout(self.config.close_timeout, connection.close()).await;
        });
        join_all(closes).await;
        metrics::set_push_connections(0);
        tracing::info!("Broadcast hub stopped");
    }
}
