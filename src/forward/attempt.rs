//! Outcome of a single forwarding attempt.

use hyper::body::Incoming;
use hyper::Response;
use std::fmt;

use crate::pool::PooledConnection;

/// What went wrong in an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// TCP connect or handshake failed.
    Connect,
    /// The pooled connection was closed before the request was dispatched.
    ConnectionClosed,
    /// The upstream reset or closed the connection before a response head.
    ConnectionReset,
    /// The attempt deadline elapsed.
    Timeout,
    /// The upstream sent something that is not a valid HTTP response.
    MalformedResponse,
    /// A streaming request body had already started flowing upstream.
    BodyNotReplayable,
    /// Reading the inbound request body failed.
    RequestBody,
    /// The request could not be sent as constructed.
    InvalidRequest,
}

impl FailureKind {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connect => "connect",
            FailureKind::ConnectionClosed => "connection_closed",
            FailureKind::ConnectionReset => "connection_reset",
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::BodyNotReplayable => "body_not_replayable",
            FailureKind::RequestBody => "request_body",
            FailureKind::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Connect => "connect failure",
            FailureKind::ConnectionClosed => "connection closed",
            FailureKind::ConnectionReset => "connection reset",
            FailureKind::Timeout => "attempt timed out",
            FailureKind::MalformedResponse => "malformed response",
            FailureKind::BodyNotReplayable => "request body not replayable",
            FailureKind::RequestBody => "request body error",
            FailureKind::InvalidRequest => "invalid request",
        };
        f.write_str(s)
    }
}

/// Why an attempt failed and how far it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub kind: FailureKind,
    /// Whether any part of the request may have reached the upstream.
    pub request_sent: bool,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, request_sent: bool, detail: impl Into<String>) -> Self {
        Self {
            kind,
            request_sent,
            detail: detail.into(),
        }
    }

    /// Failure before anything was written to the upstream.
    pub fn before_send(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::new(kind, false, detail)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

/// Response head received from the upstream plus the connection it arrived on.
///
/// The connection stays checked out until the body has been streamed.
pub struct UpstreamResponse {
    pub response: Response<Incoming>,
    pub connection: PooledConnection,
}

/// Outcome of one try against one connection.
pub enum ForwardAttempt {
    Success(UpstreamResponse),
    RetryableFailure(FailureReason),
    FatalFailure(FailureReason),
}

/// A failed attempt, as handed to the retry coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    Retryable(FailureReason),
    Fatal(FailureReason),
}

impl AttemptFailure {
    pub fn reason(&self) -> &FailureReason {
        match self {
            AttemptFailure::Retryable(r) | AttemptFailure::Fatal(r) => r,
        }
    }

    pub fn into_reason(self) -> FailureReason {
        match self {
            AttemptFailure::Retryable(r) | AttemptFailure::Fatal(r) => r,
        }
    }
}

impl ForwardAttempt {
    pub fn into_result(self) -> Result<UpstreamResponse, AttemptFailure> {
        match self {
            ForwardAttempt::Success(up) => Ok(up),
            ForwardAttempt::RetryableFailure(r) => Err(AttemptFailure::Retryable(r)),
            ForwardAttempt::FatalFailure(r) => Err(AttemptFailure::Fatal(r)),
        }
    }

    /// Metric label for the outcome.
    pub fn label(&self) -> &'static str {
        match self {
            ForwardAttempt::Success(_) => "success",
            ForwardAttempt::RetryableFailure(_) => "retryable",
            ForwardAttempt::FatalFailure(_) => "fatal",
        }
    }
}
