//! Pooled upstream connections and their lifecycle.
//!
//! # Responsibilities
//! - Establish one HTTP/1.1 client connection to a destination
//! - Track connection state (Idle → InUse → Idle | Closed)
//! - Generate unique connection IDs for tracing
//! - Return the pool slot when a checked-out connection is dropped

use axum::body::Body;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::pool::destination::{Destination, Scheme};
use crate::pool::shard::SlotGuard;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Parked in the pool, available for reuse.
    Idle,
    /// Checked out by exactly one attempt or response stream.
    InUse,
    /// Torn down; never handed out again.
    Closed,
}

/// Error type for connection establishment.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {destination} timed out after {after:?}")]
    Timeout {
        destination: Destination,
        after: Duration,
    },

    #[error("connect to {destination} failed: {source}")]
    Io {
        destination: Destination,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with {destination} failed: {source}")]
    Handshake {
        destination: Destination,
        #[source]
        source: hyper::Error,
    },

    #[error("scheme {0} is not supported for upstream connections")]
    UnsupportedScheme(Scheme),
}

/// One live HTTP/1.1 connection to an upstream.
///
/// Only the pool creates these. While checked out the connection carries the
/// pool slot it occupies; dropping it without `ConnectionPool::release`
/// frees the slot and tears the transport down.
pub struct PooledConnection {
    id: ConnectionId,
    destination: Destination,
    sender: http1::SendRequest<Body>,
    driver: JoinHandle<()>,
    state: ConnectionState,
    created_at: Instant,
    idle_since: Instant,
    requests_served: u64,
    pub(crate) slot: Option<SlotGuard>,
}

impl PooledConnection {
    /// Open a TCP connection and perform the HTTP/1.1 client handshake.
    pub(crate) async fn connect(
        destination: &Destination,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        if destination.scheme() != Scheme::Http {
            return Err(ConnectError::UnsupportedScheme(destination.scheme()));
        }

        let addr = (destination.host(), destination.port());
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::Timeout {
                destination: destination.clone(),
                after: connect_timeout,
            })?
            .map_err(|source| ConnectError::Io {
                destination: destination.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| ConnectError::Handshake {
                destination: destination.clone(),
                source,
            })?;

        let id = ConnectionId::next();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(connection_id = %id, error = %e, "Upstream connection closed with error");
            }
        });

        tracing::debug!(connection_id = %id, destination = %destination, "Upstream connection established");

        let now = Instant::now();
        Ok(Self {
            id,
            destination: destination.clone(),
            sender,
            driver,
            state: ConnectionState::InUse,
            created_at: now,
            idle_since: now,
            requests_served: 0,
            slot: None,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// False once the upstream closed the transport or the driver stopped.
    pub fn is_open(&self) -> bool {
        self.state != ConnectionState::Closed && !self.sender.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time spent parked in the pool; zero while checked out.
    pub fn idle_for(&self) -> Duration {
        match self.state {
            ConnectionState::Idle => self.idle_since.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// Wait until the connection can accept a request.
    pub(crate) async fn ready(&mut self) -> Result<(), hyper::Error> {
        self.sender.ready().await
    }

    pub(crate) async fn send_request(
        &mut self,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        self.requests_served += 1;
        self.sender.send_request(request).await
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.idle_since = Instant::now();
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = ConnectionState::InUse;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("state", &self.state)
            .field("requests_served", &self.requests_served)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.driver.abort();
        tracing::trace!(connection_id = %self.id, "Upstream connection dropped");
    }
}
