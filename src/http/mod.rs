//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, limits)
//!     → resolver.rs (pick the upstream Destination)
//!     → ForwardRequest::from_inbound (buffer small bodies, stream the rest)
//!     → ProxyOrchestrator::proxy
//!     → respond() → Send to client
//! ```

pub mod resolver;
pub mod server;

pub use resolver::DestinationResolver;
pub use server::HttpServer;
