//! Keep-alive for idle push connections.
//!
//! A connection that has received nothing on any channel for the idle
//! timeout gets a `{"type":"heartbeat"}` frame. A failed heartbeat prunes
//! the connection the same way a failed broadcast does.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

use super::hub::BroadcastHub;
use crate::application::ports::{ConnectionId, PushConnection};
use crate::infrastructure::metrics;

/// Frame sent to idle connections.
#[derive(Debug, Serialize)]
struct Heartbeat {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: i64,
}

impl Heartbeat {
    fn now() -> Self {
        Self {
            kind: "heartbeat",
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Sweep loop spawned by [`BroadcastHub::start`].
pub(super) async fn run(hub: Arc<BroadcastHub>) {
    if hub.config.heartbeat_interval.is_zero() {
        tracing::warn!("Heartbeat interval is zero, sweeper disabled");
        return;
    }
    let mut interval = tokio::time::interval(hub.config.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            () = hub.cancel.cancelled() => {
                tracing::debug!("Heartbeat sweeper cancelled");
                break;
            }
            _ = interval.tick() => {
                let sent = sweep(&hub).await;
                if sent > 0 {
                    tracing::debug!(sent, "Heartbeats sent");
                }
            }
        }
    }
}

/// Heartbeat every idle connection once. Returns the number sent.
pub(super) async fn sweep(hub: &BroadcastHub) -> usize {
    let idle = idle_connections(hub).await;
    if idle.is_empty() {
        return 0;
    }

    let Ok(frame) = serde_json::to_string(&Heartbeat::now()) else {
        return 0;
    };

    let sends = idle.into_iter().map(|connection| {
        let frame = frame.as_str();
        async move {
            let result = hub.deliver(connection.as_ref(), frame).await;
            (connection, result)
        }
    });
    let results = join_all(sends).await;

    let mut sent = 0;
    let mut alive = Vec::new();
    for (connection, result) in results {
        match result {
            Ok(()) => {
                sent += 1;
                alive.push(connection.id());
            }
            Err(e) => {
                tracing::debug!(connection = %connection.id(), error = %e, "Heartbeat failed");
                hub.prune(connection).await;
            }
        }
    }

    touch(hub, &alive).await;
    hub.heartbeats_sent.fetch_add(sent as u64, Ordering::Relaxed);
    metrics::record_heartbeats(sent);
    sent
}

/// Connections whose newest send on any channel is older than the idle timeout.
async fn idle_connections(hub: &BroadcastHub) -> Vec<Arc<dyn PushConnection>> {
    let channels: Vec<_> = hub.channels.read().values().cloned().collect();
    let mut latest: HashMap<ConnectionId, (Instant, Arc<dyn PushConnection>)> = HashMap::new();

    for shared in channels {
        let guard = shared.lock().await;
        for (id, entry) in &guard.push {
            latest
                .entry(*id)
                .and_modify(|(seen, _)| *seen = (*seen).max(entry.last_sent))
                .or_insert_with(|| (entry.last_sent, Arc::clone(&entry.connection)));
        }
    }

    let now = Instant::now();
    latest
        .into_values()
        .filter(|(seen, _)| now.duration_since(*seen) >= hub.config.heartbeat_idle_timeout)
        .map(|(_, connection)| connection)
        .collect()
}

async fn touch(hub: &BroadcastHub, ids: &[ConnectionId]) {
    if ids.is_empty() {
        return;
    }
    let channels: Vec<_> = hub.channels.read().values().cloned().collect();
    let now = Instant::now();
    for shared in channels {
        let mut guard = shared.lock().await;
        for id in ids {
            if let Some(entry) = guard.push.get_mut(id) {
                entry.last_sent = now;
            }
        }
    }
}
