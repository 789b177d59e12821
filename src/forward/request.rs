//! Requests as the forwarding core sees them.
//!
//! # Responsibilities
//! - Carry method, target, ordered headers and a lazy body
//! - Decide whether the body can be replayed on another attempt
//! - Record when a streaming body started flowing upstream

use axum::body::Body;
use bytes::{Buf, Bytes};
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use hyper::{HeaderMap, Method, Request, Uri};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::ProxyError;

/// Header that marks a non-idempotent request as safe to retry.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Body of a forwarded request.
pub enum RequestBody {
    /// No body.
    Empty,
    /// Fully buffered; can be replayed from the start on every attempt.
    Buffered(Bytes),
    /// Lazily produced by the inbound source; can be taken exactly once.
    Streaming(Option<Body>),
}

impl RequestBody {
    pub fn streaming(body: Body) -> Self {
        RequestBody::Streaming(Some(body))
    }

    /// True when every attempt can send the body from its first byte.
    pub fn is_replayable(&self) -> bool {
        matches!(self, RequestBody::Empty | RequestBody::Buffered(_))
    }

    /// True once a streaming body was handed to an attempt.
    pub fn is_consumed(&self) -> bool {
        matches!(self, RequestBody::Streaming(None))
    }

    /// Produce the body for one attempt; `None` if a stream was already taken.
    pub(crate) fn take_for_attempt(&mut self) -> Option<Body> {
        match self {
            RequestBody::Empty => Some(Body::empty()),
            RequestBody::Buffered(bytes) => Some(Body::from(bytes.clone())),
            RequestBody::Streaming(body) => body.take(),
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            RequestBody::Streaming(Some(_)) => f.write_str("Streaming"),
            RequestBody::Streaming(None) => f.write_str("Streaming(consumed)"),
        }
    }
}

/// One inbound request to forward.
#[derive(Debug)]
pub struct ForwardRequest {
    pub method: Method,
    pub uri: Uri,
    /// Order-preserving; repeated names are kept.
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Peer address appended to the forwarding chain.
    pub client_addr: Option<IpAddr>,
    pub request_id: Option<String>,
    idempotent_hint: bool,
}

impl ForwardRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            client_addr: None,
            request_id: None,
            idempotent_hint: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Mark the request safe to retry whatever its method.
    pub fn mark_idempotent(mut self) -> Self {
        self.idempotent_hint = true;
        self
    }

    /// GET, HEAD, OPTIONS and TRACE, plus explicitly marked requests.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent_hint
            || matches!(
                self.method,
                Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
            )
    }

    /// Convert an inbound request.
    ///
    /// Bodies with a known length up to `max_replay_bytes` are buffered so
    /// retries can resend them; anything larger or of unknown length streams.
    pub async fn from_inbound(
        request: Request<Body>,
        client_addr: Option<IpAddr>,
        max_replay_bytes: usize,
    ) -> Result<Self, ProxyError> {
        let (parts, body) = request.into_parts();

        let hint = body.size_hint();
        let body = match hint.exact() {
            Some(0) => RequestBody::Empty,
            Some(len) if len <= max_replay_bytes as u64 => {
                let bytes = axum::body::to_bytes(body, max_replay_bytes)
                    .await
                    .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {}", e)))?;
                RequestBody::Buffered(bytes)
            }
            _ if body.is_end_stream() => RequestBody::Empty,
            _ => RequestBody::streaming(body),
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let idempotent_hint = parts.headers.contains_key(IDEMPOTENCY_KEY);

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            client_addr,
            request_id,
            idempotent_hint,
        })
    }
}

/// Body wrapper that flags the first non-empty data frame handed upstream.
pub(crate) struct TrackedBody<B> {
    inner: B,
    started: Arc<AtomicBool>,
}

impl<B> TrackedBody<B> {
    pub(crate) fn new(inner: B, started: Arc<AtomicBool>) -> Self {
        Self { inner, started }
    }
}

impl<B> HttpBody for TrackedBody<B>
where
    B: HttpBody + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &poll {
            if frame.data_ref().is_some_and(|data| data.has_remaining()) {
                this.started.store(true, Ordering::Release);
            }
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
