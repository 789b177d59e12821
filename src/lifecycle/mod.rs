//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Shutdown (shutdown.rs):
//!     trigger() → server stops accepting, evictor exits,
//!                 in-flight requests are cancelled, process exits
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then logging and metrics, then listener
//! - One broadcast fans the shutdown out to every long-running task

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, Signal};
