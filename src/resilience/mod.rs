//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against upstream:
//!     → timeouts.rs (per-attempt deadline)
//!     → On failure: retries.rs (eligibility, budget, state machine)
//!     → backoff.rs (jittered delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream attempt has a deadline
//! - Retries only when resending cannot duplicate side effects
//! - Pool exhaustion is never retried here

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use backoff::{calculate_backoff, Backoff};
pub use retries::{RetryBudget, RetryCoordinator, RetryDecision, RetryPolicy, RetryState};
pub use timeouts::Timeouts;
