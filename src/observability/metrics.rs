//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, attempts, retries, pool, streams)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-destination and aggregate metrics
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status, destination
//! - `proxy_request_duration_seconds` (histogram): time to response head
//! - `proxy_attempts_total` (counter): upstream attempts by final outcome
//!   (`success`, `retried`, `failed`) and failure kind
//! - `proxy_retries_total` (counter): retries by failure kind
//! - `proxy_pool_events_total` (counter): pool activity by event
//! - `proxy_pool_connections` (gauge): in-use and idle per destination
//! - `proxy_stream_outcomes_total` (counter): how response bodies ended
//! - `proxy_stream_bytes_total` (counter): body bytes relayed to clients
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels for method, destination, status code

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record a finished request.
pub fn record_request(method: &str, status: u16, destination: &str, started: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("destination", destination.to_string()),
    ];
    counter!("proxy_requests_total", &labels).increment(1);
    histogram!("proxy_request_duration_seconds", &labels).record(started.elapsed().as_secs_f64());
}

/// Record one upstream attempt once its fate is decided.
pub fn record_attempt(outcome: &'static str, kind: &'static str) {
    counter!("proxy_attempts_total", "outcome" => outcome, "kind" => kind).increment(1);
}

/// Record a retry scheduled after a failure of `kind`.
pub fn record_retry(kind: &'static str) {
    counter!("proxy_retries_total", "kind" => kind).increment(1);
}

/// Record a pool event (`reused`, `created`, `exhausted`, ...).
pub fn record_pool_event(event: &'static str) {
    counter!("proxy_pool_events_total", "event" => event).increment(1);
}

/// Update the connection gauges for one destination.
pub fn record_pool_gauges(destination: &str, in_use: usize, idle: usize) {
    gauge!("proxy_pool_connections", "destination" => destination.to_string(), "state" => "in_use")
        .set(in_use as f64);
    gauge!("proxy_pool_connections", "destination" => destination.to_string(), "state" => "idle")
        .set(idle as f64);
}

/// Record connections removed by the idle evictor.
pub fn record_pool_eviction(evicted: usize) {
    counter!("proxy_pool_events_total", "event" => "evicted").increment(evicted as u64);
}

/// Record how a response body relay ended.
pub fn record_stream_outcome(outcome: &'static str, bytes: u64) {
    counter!("proxy_stream_outcomes_total", "outcome" => outcome).increment(1);
    counter!("proxy_stream_bytes_total").increment(bytes);
}
