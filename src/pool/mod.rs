//! Upstream connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrator needs a connection for a Destination
//!     → registry.rs (find or create the destination's shard)
//!     → shard.rs (reuse idle, reserve a slot, or wait)
//!     → connection.rs (TCP connect + HTTP/1.1 handshake on a fresh slot)
//!     → PooledConnection handed to the forwarder
//!
//! After the attempt / response stream:
//!     release(conn, healthy) → idle tail | destroyed
//!
//! Periodically:
//!     eviction.rs → evict_idle(idle_ttl)
//! ```
//!
//! # Design Decisions
//! - One shard per destination; saturation of one never blocks another
//! - `in_use + idle <= max_per_destination` is checked under the shard lock
//! - Connections move by value, so two attempts can never share one
//! - Dropping a checked-out connection counts as destroying it

pub mod connection;
pub mod destination;
pub mod eviction;
pub mod registry;
mod shard;

pub use connection::{ConnectError, ConnectionId, ConnectionState, PooledConnection};
pub use destination::{Destination, DestinationError, Scheme};
pub use eviction::IdleEvictor;
pub use registry::{ConnectionPool, PoolError, PoolSettings, PoolStats};
