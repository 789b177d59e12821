//! Request forwarding over a pooled connection.
//!
//! # Responsibilities
//! - Rewrite the request for the upstream leg (origin-form target, headers)
//! - Stream headers then body, bounded by the attempt deadline
//! - Classify failures as retryable or fatal
//! - Destroy the connection on any failure
//!
//! # Design Decisions
//! - The deadline covers everything up to the response head, not just connect
//! - A non-replayable body that started flowing makes any failure fatal
//! - On success the connection travels with the response to the streamer

use axum::body::Body;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri, Version};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::forward::attempt::{FailureKind, FailureReason, ForwardAttempt, UpstreamResponse};
use crate::forward::headers;
use crate::forward::request::{ForwardRequest, TrackedBody};
use crate::pool::{ConnectionPool, Destination, PooledConnection};

/// How far an attempt progressed; read after the attempt future is gone.
#[derive(Default)]
struct Progress {
    dispatched: AtomicBool,
    body_started: Arc<AtomicBool>,
}

impl Progress {
    fn dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    fn body_started(&self) -> bool {
        self.body_started.load(Ordering::Acquire)
    }
}

/// Sends one attempt of a request over a borrowed pooled connection.
#[derive(Debug, Clone)]
pub struct Forwarder {
    pool: Arc<ConnectionPool>,
}

impl Forwarder {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Forward `request` over `conn`, giving up at `deadline`.
    ///
    /// On failure the connection has already been destroyed when this returns.
    pub async fn forward(
        &self,
        mut conn: PooledConnection,
        request: &mut ForwardRequest,
        deadline: Instant,
    ) -> ForwardAttempt {
        let progress = Progress::default();
        let connection_id = conn.id();

        let result =
            tokio::time::timeout_at(deadline, dispatch(&mut conn, request, &progress)).await;

        let reason = match result {
            Ok(Ok(response)) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    status = %response.status(),
                    "Upstream response head received"
                );
                return ForwardAttempt::Success(UpstreamResponse {
                    response,
                    connection: conn,
                });
            }
            Ok(Err(reason)) => reason,
            Err(_) => FailureReason::new(
                FailureKind::Timeout,
                progress.dispatched(),
                "no response head before the attempt deadline",
            ),
        };

        self.pool.release(conn, false);

        let attempt = classify(reason, progress.body_started(), request.body.is_replayable());
        match &attempt {
            ForwardAttempt::RetryableFailure(r) | ForwardAttempt::FatalFailure(r) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    method = %request.method,
                    classification = attempt.label(),
                    request_sent = r.request_sent,
                    error = %r,
                    "Upstream attempt failed"
                );
            }
            ForwardAttempt::Success(_) => {}
        }
        attempt
    }
}

async fn dispatch(
    conn: &mut PooledConnection,
    request: &mut ForwardRequest,
    progress: &Progress,
) -> Result<Response<Incoming>, FailureReason> {
    conn.ready()
        .await
        .map_err(|e| FailureReason::before_send(FailureKind::ConnectionClosed, e.to_string()))?;

    let body = request.body.take_for_attempt().ok_or_else(|| {
        FailureReason::before_send(
            FailureKind::BodyNotReplayable,
            "streaming body was consumed by an earlier attempt",
        )
    })?;
    let body = Body::new(TrackedBody::new(body, progress.body_started.clone()));
    let upstream = build_upstream_request(request, conn.destination(), body);

    progress.dispatched.store(true, Ordering::Release);
    conn.send_request(upstream)
        .await
        .map_err(|e| reason_from_hyper(&e, progress.body_started()))
}

/// Rewrite the inbound request for the upstream leg.
pub(crate) fn build_upstream_request(
    request: &ForwardRequest,
    destination: &Destination,
    body: Body,
) -> Request<Body> {
    let uri = request
        .uri
        .path_and_query()
        .cloned()
        .map(Uri::from)
        .unwrap_or_else(|| Uri::from_static("/"));

    let mut upstream = Request::new(body);
    *upstream.method_mut() = request.method.clone();
    *upstream.uri_mut() = uri;
    *upstream.version_mut() = Version::HTTP_11;
    *upstream.headers_mut() = headers::upstream_headers(
        &request.headers,
        destination,
        request.client_addr,
        request.request_id.as_deref(),
    );
    upstream
}

fn reason_from_hyper(e: &hyper::Error, body_started: bool) -> FailureReason {
    let detail = e.to_string();
    if e.is_canceled() {
        // The dispatcher never wrote the request.
        FailureReason::before_send(FailureKind::ConnectionClosed, detail)
    } else if e.is_parse() || e.is_parse_status() || e.is_parse_too_large() {
        FailureReason::new(FailureKind::MalformedResponse, true, detail)
    } else if e.is_user() || e.is_body_write_aborted() {
        let kind = if body_started {
            FailureKind::RequestBody
        } else {
            FailureKind::InvalidRequest
        };
        FailureReason::new(kind, true, detail)
    } else {
        FailureReason::new(FailureKind::ConnectionReset, true, detail)
    }
}

/// Decide whether a failed attempt may be retried at all.
fn classify(reason: FailureReason, body_started: bool, replayable: bool) -> ForwardAttempt {
    match reason.kind {
        FailureKind::MalformedResponse
        | FailureKind::RequestBody
        | FailureKind::InvalidRequest
        | FailureKind::BodyNotReplayable => ForwardAttempt::FatalFailure(reason),
        _ if body_started && !replayable => ForwardAttempt::FatalFailure(FailureReason::new(
            FailureKind::BodyNotReplayable,
            true,
            format!("{} after the request body began streaming", reason),
        )),
        _ => ForwardAttempt::RetryableFailure(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::request::RequestBody;
    use bytes::Bytes;
    use hyper::{HeaderMap, Method};

    #[test]
    fn test_classify_retryable_and_fatal() {
        let reset = FailureReason::new(FailureKind::ConnectionReset, true, "eof");
        assert!(matches!(
            classify(reset.clone(), false, false),
            ForwardAttempt::RetryableFailure(_)
        ));
        assert!(matches!(
            classify(reset.clone(), true, true),
            ForwardAttempt::RetryableFailure(_)
        ));

        match classify(reset, true, false) {
            ForwardAttempt::FatalFailure(r) => {
                assert_eq!(r.kind, FailureKind::BodyNotReplayable);
                assert!(r.request_sent);
            }
            _ => panic!("partially streamed body must be fatal"),
        }

        let malformed = FailureReason::new(FailureKind::MalformedResponse, true, "bad status line");
        assert!(matches!(
            classify(malformed, false, true),
            ForwardAttempt::FatalFailure(_)
        ));

        let closed = FailureReason::before_send(FailureKind::ConnectionClosed, "closed");
        match classify(closed, false, false) {
            ForwardAttempt::RetryableFailure(r) => assert!(!r.request_sent),
            _ => panic!("closed before dispatch must be retryable"),
        }
    }

    #[test]
    fn test_upstream_request_uses_origin_form() {
        let mut headers = HeaderMap::new();
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-app", "1".parse().unwrap());

        let request = ForwardRequest::new(
            Method::POST,
            "http://public.example/api/items?page=2".parse().unwrap(),
        )
        .with_headers(headers)
        .with_body(RequestBody::Buffered(Bytes::from_static(b"{}")))
        .with_client_addr("10.1.1.1".parse().unwrap());

        let dest = Destination::http("127.0.0.1", 9000);
        let upstream = build_upstream_request(&request, &dest, Body::empty());

        assert_eq!(upstream.method(), Method::POST);
        assert_eq!(upstream.uri(), "/api/items?page=2");
        assert_eq!(upstream.version(), Version::HTTP_11);
        assert!(upstream.headers().get("keep-alive").is_none());
        assert_eq!(upstream.headers()["x-app"], "1");
        assert_eq!(upstream.headers()["x-forwarded-for"], "10.1.1.1");
        assert_eq!(upstream.headers()["host"], "127.0.0.1:9000");
    }
}
