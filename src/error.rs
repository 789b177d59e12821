//! Terminal errors of the forwarding path and their client-facing responses.

use axum::response::{IntoResponse, Response};
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::forward::{FailureKind, FailureReason};
use crate::pool::{ConnectError, Destination, DestinationError, PoolError};

/// Status reported when the client went away before a response was produced.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Outcome of a request that could not be answered by the upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connection pool for {destination} exhausted after waiting {waited:?}")]
    PoolExhausted {
        destination: Destination,
        waited: Duration,
    },

    #[error("upstream request failed: {0}")]
    Fatal(FailureReason),

    #[error("upstream request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: FailureReason },

    #[error("request cancelled")]
    StreamAborted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// The last upstream failure, if any.
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            ProxyError::Fatal(reason) => Some(reason),
            ProxyError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProxyError::StreamAborted)
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Fatal(reason) | ProxyError::RetriesExhausted { last: reason, .. } => {
                if reason.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            ProxyError::StreamAborted => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Metric label for the error class.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyError::PoolExhausted { .. } => "pool_exhausted",
            ProxyError::Fatal(_) => "fatal",
            ProxyError::RetriesExhausted { .. } => "retries_exhausted",
            ProxyError::StreamAborted => "aborted",
            ProxyError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<PoolError> for ProxyError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted {
                destination,
                waited,
            } => ProxyError::PoolExhausted {
                destination,
                waited,
            },
            PoolError::Connect(e) => ProxyError::Fatal(connect_failure(&e)),
        }
    }
}

impl From<DestinationError> for ProxyError {
    fn from(e: DestinationError) -> Self {
        ProxyError::InvalidRequest(e.to_string())
    }
}

/// Failure reason for a connection that could not be established.
pub(crate) fn connect_failure(e: &ConnectError) -> FailureReason {
    let kind = match e {
        ConnectError::Timeout { .. } => FailureKind::Timeout,
        _ => FailureKind::Connect,
    };
    FailureReason::before_send(kind, e.to_string())
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, self.to_string()).into_response();
        if let ProxyError::PoolExhausted { .. } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
