//! `GET /stream/{channel}` Server-Sent Events over a pull queue.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};

use super::{ApiError, ServerState};

pub(super) async fn sse_handler(
    Path(channel): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let queue = state.hub.create_pull_queue(&channel).await?;
    tracing::info!(queue = %queue.id(), channel = %channel, "SSE subscriber connected");

    let snapshot = state.ticker_snapshot(&channel);
    let events = stream::iter(snapshot)
        .chain(queue.into_stream().map(|message| message.to_string()))
        .map(|data| Ok(Event::default().data(data)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
