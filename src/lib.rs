//! Forwarding core of an HTTP reverse proxy.
//!
//! Pooled upstream connections, per-attempt forwarding with failure
//! classification, retries with backoff and a retry budget, and
//! cancellation-safe response streaming.

pub mod config;
pub mod error;
pub mod forward;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod proxy;
pub mod resilience;
pub mod stream;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pool::{ConnectionPool, Destination};
pub use proxy::{respond, ForwardResult, ProxyOrchestrator};
