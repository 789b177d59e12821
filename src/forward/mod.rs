//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! ForwardRequest (request.rs)
//!     → forwarder.rs (ready connection, rewrite target)
//!     → headers.rs (strip hop-by-hop, extend forwarding chain)
//!     → send headers, then body frames (TrackedBody notes the first byte)
//!     → ForwardAttempt (attempt.rs): Success | RetryableFailure | FatalFailure
//! ```

pub mod attempt;
pub mod forwarder;
pub mod headers;
pub mod request;

pub use attempt::{AttemptFailure, FailureKind, FailureReason, ForwardAttempt, UpstreamResponse};
pub use forwarder::Forwarder;
pub use request::{ForwardRequest, RequestBody, IDEMPOTENCY_KEY};
