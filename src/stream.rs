//! Stream endpoint: one SSE connection per validated token.
//!
//! Connection lifecycle: acquire a slot under the global cap, consume the
//! token, send the snapshot as the first frame, then forward every hub
//! event until the transport closes. A comment keep-alive frame goes out
//! every 15 s; a failed write (keep-alive or data) tears the connection
//! down, which drops the [`StreamGuard`] and releases the slot.
//!
//! The slot is released by `Drop`, so every close path — client
//! disconnect, write failure, server shutdown — decrements the counter
//! exactly once no matter how the paths overlap.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::api::{ApiError, SharedState};
use crate::hub::MonitorEvent;

/// Bounds the number of concurrently open stream connections.
#[derive(Debug, Clone)]
pub struct StreamLimiter {
    open: Arc<AtomicUsize>,
    max: usize,
}

impl StreamLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            open: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Claim a slot. Fails at capacity without touching the counter.
    pub fn try_acquire(&self) -> Option<StreamGuard> {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max).then_some(open + 1)
            })
            .ok()?;
        Some(StreamGuard {
            open: Arc::clone(&self.open),
        })
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Releases its slot exactly once, when dropped.
#[derive(Debug)]
pub struct StreamGuard {
    open: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let before = self.open.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(open = before.saturating_sub(1), "stream connection closed");
    }
}

/// Ties a [`StreamGuard`] to the lifetime of the SSE body stream.
struct GuardedStream<S> {
    inner: S,
    _guard: StreamGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Single-use stream token. Carried in the query string because
    /// `EventSource` cannot set headers or cookies for cross-origin use.
    pub token: String,
}

/// `GET /api/stream` — open a live event stream.
pub async fn stream_handler(
    State(state): State<SharedState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Capacity first: a rejected connection must not consume the token,
    // so the client can retry the same credential once a slot frees up.
    let Some(guard) = state.stream_limiter.try_acquire() else {
        tracing::warn!(
            max = state.stream_limiter.max(),
            "stream rejected: connection cap reached"
        );
        return Err(ApiError::StreamLimitReached);
    };

    let claims = state.tokens.validate(&query.token)?;

    // Snapshot and subscription are taken atomically: nothing published
    // after the snapshot is missed, nothing inside it is redelivered.
    let (snapshot, rx) = state.monitor.subscribe();
    tracing::info!(
        user_id = %claims.user_id,
        stream_id = %claims.stream_id,
        open = state.stream_limiter.open_count(),
        "stream opened"
    );

    let events = BroadcastStream::new(rx).filter_map(|received| match received {
        Ok(event) => encode_event(&event),
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            // Overwritten events are gone for this subscriber; the stream
            // continues from the tail and only a reconnect resyncs fully.
            tracing::warn!(missed, "stream subscriber lagged");
            None
        }
    });
    let stream = tokio_stream::iter(encode_event(&snapshot)).chain(events);

    Ok(Sse::new(GuardedStream {
        inner: stream,
        _guard: guard,
    })
    .keep_alive(KeepAlive::new().interval(state.config.keep_alive_interval)))
}

fn encode_event(event: &MonitorEvent) -> Option<Result<Event, Infallible>> {
    match Event::default().json_data(event) {
        Ok(frame) => Some(Ok(frame)),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode stream event");
            None
        }
    }
}
