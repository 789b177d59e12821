//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the forwarding proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration for the inbound adapter.
    pub listener: ListenerConfig,

    /// Optional fixed upstream override.
    pub upstream: UpstreamConfig,

    /// Upstream connection pool settings.
    pub pool: PoolConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Body streaming settings.
    pub streaming: StreamingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent inbound requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Fixed upstream configuration.
///
/// When `address` is unset the destination is taken from the inbound
/// request target, which makes the proxy a pure passthrough.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream address (e.g., "http://127.0.0.1:3000").
    pub address: Option<String>,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on in-use plus idle connections per destination.
    pub max_connections_per_destination: usize,

    /// Idle connections older than this are destroyed, in seconds.
    pub idle_ttl_secs: u64,

    /// How often the idle evictor runs, in seconds.
    pub idle_eviction_interval_secs: u64,
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn idle_eviction_interval(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_interval_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_destination: 32,
            idle_ttl_secs: 90,
            idle_eviction_interval_secs: 30,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in milliseconds.
    pub connect_ms: u64,

    /// Maximum wait for a pool slot in milliseconds.
    pub acquire_ms: u64,

    /// Per-attempt deadline (send request, receive response head) in milliseconds.
    pub attempt_ms: u64,

    /// Maximum gap between two upstream body chunks in milliseconds.
    pub stream_idle_ms: u64,

    /// Overall inbound request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            acquire_ms: 5_000,
            attempt_ms: 30_000,
            stream_idle_ms: 60_000,
            request_secs: 120,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries.
    pub enabled: bool,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Cap retries to a share of recent traffic. Off by default so every
    /// retryable request gets its full `max_retries`.
    pub budget_enabled: bool,

    /// Fraction of requests in a window that may be retried.
    /// e.g., 0.2 for a 20% budget.
    pub budget_ratio: f32,

    /// Retries always allowed per window regardless of the ratio.
    pub min_retries_per_window: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            budget_enabled: false,
            budget_ratio: 0.2,
            min_retries_per_window: 10,
        }
    }
}

/// Body streaming configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Response chunks buffered between the upstream reader and the client.
    pub buffer_chunks: usize,

    /// Request bodies of known length up to this size are buffered so they
    /// can be replayed on retry.
    pub max_replay_body_bytes: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_chunks: 4,
            max_replay_body_bytes: 64 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
