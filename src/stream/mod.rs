//! Response streaming subsystem.
//!
//! # Data Flow
//! ```text
//! UpstreamResponse (head + connection)
//!     → head relayed at once (hop-by-hop stripped)
//!     → pump task: upstream frame ─▶ bounded channel ─▶ client body
//!     → end: Complete → connection parked idle
//!            otherwise → connection destroyed
//! ```

pub mod streamer;

pub use streamer::{ResponseStreamer, StreamError, StreamOutcome};
