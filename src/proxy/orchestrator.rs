//! Per-request composition of pool, forwarder, retries and streamer.
//!
//! # Responsibilities
//! - Drive acquire → forward → decide → (backoff → retry | finalize)
//! - Hand successful responses to the streamer and return at once
//! - Observe cancellation during every wait
//! - Translate terminal outcomes into one result per request
//!
//! # Design Decisions
//! - Pool exhaustion ends the request (503); it is not retried
//! - Connect failures count as attempts and follow the retry rules
//! - The success path never waits for the body

use axum::body::Body;
use axum::response::IntoResponse;
use hyper::Response;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::error::{connect_failure, ProxyError};
use crate::forward::{FailureKind, FailureReason, ForwardAttempt, ForwardRequest, Forwarder};
use crate::observability::metrics;
use crate::pool::{ConnectError, ConnectionPool, Destination, PoolError, PoolSettings};
use crate::resilience::{RetryCoordinator, RetryDecision, RetryPolicy, Timeouts};
use crate::stream::ResponseStreamer;

/// Terminal outcome for one inbound request.
pub type ForwardResult = Result<Response<Body>, ProxyError>;

/// Forwards requests to upstreams with pooling, retries and streaming.
#[derive(Debug)]
pub struct ProxyOrchestrator {
    pool: Arc<ConnectionPool>,
    forwarder: Forwarder,
    streamer: ResponseStreamer,
    policy: RetryPolicy,
    timeouts: Timeouts,
}

impl ProxyOrchestrator {
    pub fn new(config: &ProxyConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(PoolSettings::from_config(
            &config.pool,
            &config.timeouts,
        )));
        Self::with_pool(config, pool)
    }

    /// Build on an existing pool, e.g. one shared with an idle evictor.
    pub fn with_pool(config: &ProxyConfig, pool: Arc<ConnectionPool>) -> Self {
        Self {
            forwarder: Forwarder::new(pool.clone()),
            streamer: ResponseStreamer::from_config(pool.clone(), &config.streaming, &config.timeouts),
            policy: RetryPolicy::from_config(&config.retries),
            timeouts: Timeouts::from_config(&config.timeouts),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Forward `request` to `destination`.
    ///
    /// Returns as soon as a response head is available; the body streams
    /// afterwards under `cancel`.
    pub async fn proxy(
        &self,
        destination: &Destination,
        mut request: ForwardRequest,
        cancel: CancellationToken,
    ) -> ForwardResult {
        let started = Instant::now();
        let method = request.method.to_string();
        let request_id = request.request_id.clone().unwrap_or_default();
        self.policy.record_request();

        let mut coordinator = RetryCoordinator::new(&self.policy);

        let result = loop {
            let attempt = coordinator.begin_attempt();
            tracing::debug!(
                request_id = %request_id,
                destination = %destination,
                attempt,
                "Starting upstream attempt"
            );

            let outcome = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    coordinator.abandon();
                    break Err(ProxyError::StreamAborted);
                }
                outcome = self.attempt(destination, &mut request) => outcome,
            };

            let failure = match outcome.map(ForwardAttempt::into_result) {
                Ok(Ok(upstream)) => {
                    metrics::record_attempt("success", "none");
                    coordinator.succeeded();
                    break Ok(self.streamer.stream(upstream, cancel.clone()));
                }
                Ok(Err(failure)) => failure,
                Err(e) => {
                    coordinator.abandon();
                    break Err(e);
                }
            };

            let kind = failure.reason().kind.as_str();
            let decision = coordinator.decide(&failure, &request);
            metrics::record_attempt(decision.outcome_label(), kind);
            match decision {
                RetryDecision::GiveUp(e) => break Err(e),
                RetryDecision::Retry(delay) => {
                    metrics::record_retry(kind);
                    tracing::info!(
                        request_id = %request_id,
                        destination = %destination,
                        attempt,
                        delay = ?delay,
                        error = %failure.reason(),
                        "Retrying request"
                    );

                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            coordinator.abandon();
                            break Err(ProxyError::StreamAborted);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        let destination_label = destination.to_string();
        match &result {
            Ok(response) => {
                metrics::record_request(&method, response.status().as_u16(), &destination_label, started);
            }
            Err(e) if e.is_cancellation() => {
                tracing::debug!(
                    request_id = %request_id,
                    destination = %destination,
                    attempts = coordinator.attempts(),
                    "Request cancelled"
                );
                metrics::record_request(&method, e.status_code().as_u16(), &destination_label, started);
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    destination = %destination,
                    attempts = coordinator.attempts(),
                    error = %e,
                    "Request failed"
                );
                metrics::record_request(&method, e.status_code().as_u16(), &destination_label, started);
            }
        }

        result
    }

    /// One acquire-and-forward step.
    async fn attempt(
        &self,
        destination: &Destination,
        request: &mut ForwardRequest,
    ) -> Result<ForwardAttempt, ProxyError> {
        let conn = match self.pool.acquire(destination, self.timeouts.acquire).await {
            Ok(conn) => conn,
            Err(PoolError::Connect(ConnectError::UnsupportedScheme(scheme))) => {
                return Ok(ForwardAttempt::FatalFailure(FailureReason::before_send(
                    FailureKind::InvalidRequest,
                    format!("scheme {} is not supported for upstream connections", scheme),
                )));
            }
            Err(PoolError::Connect(e)) => {
                let reason = connect_failure(&e);
                tracing::warn!(destination = %destination, error = %e, "Upstream connect failed");
                return Ok(ForwardAttempt::RetryableFailure(reason));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(self
            .forwarder
            .forward(conn, request, self.timeouts.attempt_deadline())
            .await)
    }
}

/// Turn a forwarding outcome into the response sent to the client.
pub fn respond(result: ForwardResult) -> Response<Body> {
    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
