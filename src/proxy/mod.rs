//! Proxy orchestration subsystem.
//!
//! # Data Flow
//! ```text
//! (Destination, ForwardRequest, CancellationToken)
//!     → pool.acquire ──exhausted──▶ 503
//!     → forwarder.forward
//!         ├─ Success → streamer.stream → Response (body streams later)
//!         └─ Failure → RetryCoordinator::decide
//!               ├─ Retry(delay) → sleep (cancellable) → acquire again
//!               └─ GiveUp(error) → respond() → 502 / 504
//! ```

pub mod orchestrator;

pub use orchestrator::{respond, ForwardResult, ProxyOrchestrator};
