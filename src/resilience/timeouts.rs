//! Timeout enforcement.
//!
//! # Responsibilities
//! - Resolve configured timeouts into durations
//! - Compute per-attempt deadlines
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Every attempt gets a fresh deadline; backoff sleeps are not counted
//! - Timed-out requests return 504 Gateway Timeout

use std::time::Duration;
use tokio::time::Instant;

use crate::config::TimeoutConfig;

/// Resolved timeouts for the forwarding path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub acquire: Duration,
    pub attempt: Duration,
    pub stream_idle: Duration,
    pub request: Duration,
}

impl Timeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_ms),
            acquire: Duration::from_millis(config.acquire_ms),
            attempt: Duration::from_millis(config.attempt_ms),
            stream_idle: Duration::from_millis(config.stream_idle_ms),
            request: Duration::from_secs(config.request_secs),
        }
    }

    /// Deadline for an attempt starting now.
    pub fn attempt_deadline(&self) -> Instant {
        Instant::now() + self.attempt
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let timeouts = Timeouts::from_config(&TimeoutConfig {
            connect_ms: 250,
            acquire_ms: 100,
            attempt_ms: 1_500,
            stream_idle_ms: 3_000,
            request_secs: 9,
        });
        assert_eq!(timeouts.connect, Duration::from_millis(250));
        assert_eq!(timeouts.attempt, Duration::from_millis(1_500));
        assert_eq!(timeouts.request, Duration::from_secs(9));

        let before = Instant::now();
        let deadline = timeouts.attempt_deadline();
        assert!(deadline >= before + timeouts.attempt);
    }
}
