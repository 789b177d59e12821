//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pool size > 0)
//! - Check the fixed upstream and bind addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::pool::{Destination, Scheme};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// Human readable description.
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if let Some(address) = &config.upstream.address {
        match address.parse::<Destination>() {
            Ok(dest) if dest.scheme() != Scheme::Http => {
                errors.push(ValidationError::new(
                    "upstream.address",
                    "only http upstreams are supported",
                ));
            }
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::new("upstream.address", e.to_string())),
        }
    }

    if config.pool.max_connections_per_destination == 0 {
        errors.push(ValidationError::new(
            "pool.max_connections_per_destination",
            "must be greater than 0",
        ));
    }
    if config.pool.idle_eviction_interval_secs == 0 {
        errors.push(ValidationError::new(
            "pool.idle_eviction_interval_secs",
            "must be greater than 0",
        ));
    }

    let timeouts = [
        ("timeouts.connect_ms", config.timeouts.connect_ms),
        ("timeouts.acquire_ms", config.timeouts.acquire_ms),
        ("timeouts.attempt_ms", config.timeouts.attempt_ms),
        ("timeouts.stream_idle_ms", config.timeouts.stream_idle_ms),
        ("timeouts.request_secs", config.timeouts.request_secs),
    ];
    for (field, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.retries.base_delay_ms > config.retries.max_delay_ms {
        errors.push(ValidationError::new(
            "retries.base_delay_ms",
            "must not exceed retries.max_delay_ms",
        ));
    }
    if !(0.0..=1.0).contains(&config.retries.budget_ratio) {
        errors.push(ValidationError::new("retries.budget_ratio", "must be within 0.0..=1.0"));
    }

    if config.streaming.buffer_chunks == 0 {
        errors.push(ValidationError::new("streaming.buffer_chunks", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
