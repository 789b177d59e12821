//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the catch-all forwarding handler
//! - Wire up middleware (request ID, tracing, timeout, concurrency limit)
//! - Bind server to listener
//! - Run the idle evictor alongside the server
//! - Cancel in-flight work on shutdown

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::forward::ForwardRequest;
use crate::http::resolver::DestinationResolver;
use crate::pool::{ConnectionPool, DestinationError, IdleEvictor, PoolSettings};
use crate::proxy::{respond, ProxyOrchestrator};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProxyOrchestrator>,
    pub resolver: Arc<DestinationResolver>,
    pub max_replay_body_bytes: usize,
    /// Parent of every per-request cancellation token.
    pub cancel: CancellationToken,
}

/// HTTP server for the forwarding proxy.
pub struct HttpServer {
    config: ProxyConfig,
    pool: Arc<ConnectionPool>,
    orchestrator: Arc<ProxyOrchestrator>,
    resolver: DestinationResolver,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    ///
    /// Every request's cancellation token is a child of `cancel`, usually
    /// [`Shutdown::token`](crate::lifecycle::Shutdown::token).
    pub fn new(config: ProxyConfig, cancel: CancellationToken) -> Result<Self, DestinationError> {
        let resolver = DestinationResolver::from_config(&config.upstream)?;
        let pool = Arc::new(ConnectionPool::new(PoolSettings::from_config(
            &config.pool,
            &config.timeouts,
        )));
        let orchestrator = Arc::new(ProxyOrchestrator::with_pool(&config, pool.clone()));

        Ok(Self {
            config,
            pool,
            orchestrator,
            resolver,
            cancel,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(ConcurrencyLimitLayer::new(config.listener.max_connections))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            max_connections = self.config.listener.max_connections,
            "HTTP server starting"
        );

        let state = AppState {
            orchestrator: self.orchestrator.clone(),
            resolver: Arc::new(self.resolver.clone().with_listener(addr)),
            max_replay_body_bytes: self.config.streaming.max_replay_body_bytes,
            cancel: self.cancel.clone(),
        };
        let app = Self::build_router(&self.config, state)
            .into_make_service_with_connect_info::<SocketAddr>();

        let evictor = IdleEvictor::from_config(self.pool.clone(), &self.config.pool);
        let evictor_task = tokio::spawn(evictor.run(shutdown.resubscribe()));

        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                // Usually already cancelled by the shutdown trigger; streams in
                // flight would otherwise hold the drain open.
                cancel.cancel();
            })
            .await?;

        let _ = evictor_task.await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<ProxyOrchestrator> {
        &self.orchestrator
    }
}

/// Catch-all handler: resolve the upstream and forward.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let destination = match state.resolver.resolve(&request) {
        Ok(destination) => destination,
        Err(e) => {
            tracing::warn!(uri = %request.uri(), error = %e, "Cannot resolve destination");
            return ProxyError::from(e).into_response();
        }
    };

    let forward =
        match ForwardRequest::from_inbound(request, Some(addr.ip()), state.max_replay_body_bytes)
            .await
        {
            Ok(forward) => forward,
            Err(e) => return e.into_response(),
        };

    tracing::debug!(
        request_id = forward.request_id.as_deref().unwrap_or("unknown"),
        method = %forward.method,
        destination = %destination,
        body = ?forward.body,
        "Proxying request"
    );

    let cancel = state.cancel.child_token();
    respond(state.orchestrator.proxy(&destination, forward, cancel).await)
}
