//! Upstream response streaming.
//!
//! # Responsibilities
//! - Relay the response head immediately, then body chunks as they arrive
//! - Apply client backpressure through a bounded channel
//! - Stop on cancellation, client disconnect or upstream stall
//! - Return the connection to the pool only after a clean end of body
//!
//! # Design Decisions
//! - A dedicated pump task owns the upstream body and the connection, so the
//!   release decision happens in exactly one place
//! - Trailers are not relayed

use axum::body::Body;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body as HttpBody, Incoming};
use hyper::Response;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{StreamingConfig, TimeoutConfig};
use crate::forward::headers;
use crate::forward::UpstreamResponse;
use crate::observability::metrics;
use crate::pool::{ConnectionPool, PooledConnection};

/// Error surfaced to the client side of a truncated body.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("upstream body failed: {0}")]
    Upstream(#[source] hyper::Error),

    #[error("upstream body stalled for {0:?}")]
    IdleTimeout(Duration),

    #[error("response stream aborted before the end of body")]
    Aborted,
}

/// How a body relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Complete,
    Cancelled,
    ClientGone,
    UpstreamError,
    IdleTimeout,
}

impl StreamOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StreamOutcome::Complete => "complete",
            StreamOutcome::Cancelled => "cancelled",
            StreamOutcome::ClientGone => "client_gone",
            StreamOutcome::UpstreamError => "upstream_error",
            StreamOutcome::IdleTimeout => "idle_timeout",
        }
    }

    /// Only a fully read body leaves the connection reusable.
    pub fn is_healthy(&self) -> bool {
        *self == StreamOutcome::Complete
    }
}

/// Relays upstream responses to the client side.
#[derive(Debug, Clone)]
pub struct ResponseStreamer {
    pool: Arc<ConnectionPool>,
    buffer_chunks: usize,
    idle_timeout: Duration,
}

impl ResponseStreamer {
    pub fn new(pool: Arc<ConnectionPool>, buffer_chunks: usize, idle_timeout: Duration) -> Self {
        Self {
            pool,
            buffer_chunks: buffer_chunks.max(1),
            idle_timeout,
        }
    }

    pub fn from_config(
        pool: Arc<ConnectionPool>,
        streaming: &StreamingConfig,
        timeouts: &TimeoutConfig,
    ) -> Self {
        Self::new(
            pool,
            streaming.buffer_chunks,
            Duration::from_millis(timeouts.stream_idle_ms),
        )
    }

    /// Turn an upstream response into a client response.
    ///
    /// Status and headers are available as soon as this returns; the body is
    /// produced while the client reads it.
    pub fn stream(&self, upstream: UpstreamResponse, cancel: CancellationToken) -> Response<Body> {
        let UpstreamResponse {
            response,
            connection,
        } = upstream;
        let (mut parts, body) = response.into_parts();
        headers::downstream_headers(&mut parts.headers);

        if body.is_end_stream() {
            drop(body);
            finish(&self.pool, connection, StreamOutcome::Complete, 0);
            return Response::from_parts(parts, Body::empty());
        }

        let (tx, rx) = mpsc::channel(self.buffer_chunks);
        let complete = Arc::new(AtomicBool::new(false));
        tokio::spawn(pump(
            body,
            connection,
            Relay {
                tx,
                complete: complete.clone(),
            },
            cancel,
            self.pool.clone(),
            self.idle_timeout,
        ));

        // The client body only ends cleanly if the pump saw the upstream end.
        let chunks = futures_util::stream::unfold(Some((rx, complete)), |state| async move {
            let (mut rx, complete) = state?;
            match rx.recv().await {
                Some(Ok(data)) => Some((Ok(data), Some((rx, complete)))),
                Some(Err(e)) => Some((Err(e), None)),
                None if complete.load(Ordering::Acquire) => None,
                None => Some((Err(StreamError::Aborted), None)),
            }
        });
        Response::from_parts(parts, Body::from_stream(chunks))
    }
}

/// Pump side of the client body.
struct Relay {
    tx: mpsc::Sender<Result<Bytes, StreamError>>,
    complete: Arc<AtomicBool>,
}

async fn pump(
    mut body: Incoming,
    connection: PooledConnection,
    relay: Relay,
    cancel: CancellationToken,
    pool: Arc<ConnectionPool>,
    idle_timeout: Duration,
) {
    let Relay { tx, complete } = relay;
    let mut relayed: u64 = 0;
    let mut failure = None;

    let outcome = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break StreamOutcome::Cancelled,
            _ = tx.closed() => break StreamOutcome::ClientGone,
            frame = tokio::time::timeout(idle_timeout, body.frame()) => match frame {
                Err(_) => {
                    failure = Some(StreamError::IdleTimeout(idle_timeout));
                    break StreamOutcome::IdleTimeout;
                }
                Ok(None) => break StreamOutcome::Complete,
                Ok(Some(Err(e))) => {
                    failure = Some(StreamError::Upstream(e));
                    break StreamOutcome::UpstreamError;
                }
                Ok(Some(Ok(frame))) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if data.is_empty() {
                        continue;
                    }
                    let len = data.len() as u64;

                    // Waiting on a slow client must still observe cancellation.
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => break StreamOutcome::Cancelled,
                        sent = tx.send(Ok(data)) => {
                            if sent.is_err() {
                                break StreamOutcome::ClientGone;
                            }
                            relayed += len;
                        }
                    }
                }
            }
        }
    };

    if outcome == StreamOutcome::Complete {
        complete.store(true, Ordering::Release);
    }
    drop(body);
    finish(&pool, connection, outcome, relayed);

    // The connection is already gone; the error only has to reach the
    // client so a truncated body never ends cleanly.
    if let Some(error) = failure {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {}
            _ = tx.send(Err(error)) => {}
        }
    }
}

fn finish(pool: &ConnectionPool, connection: PooledConnection, outcome: StreamOutcome, relayed: u64) {
    let connection_id = connection.id();
    match outcome {
        StreamOutcome::Complete => {
            tracing::debug!(connection_id = %connection_id, bytes = relayed, "Response body relayed");
        }
        StreamOutcome::Cancelled | StreamOutcome::ClientGone => {
            tracing::debug!(
                connection_id = %connection_id,
                bytes = relayed,
                outcome = outcome.label(),
                "Response stream stopped early"
            );
        }
        StreamOutcome::UpstreamError | StreamOutcome::IdleTimeout => {
            tracing::warn!(
                connection_id = %connection_id,
                bytes = relayed,
                outcome = outcome.label(),
                "Response stream aborted"
            );
        }
    }

    pool.release(connection, outcome.is_healthy());
    metrics::record_stream_outcome(outcome.label(), relayed);
}
