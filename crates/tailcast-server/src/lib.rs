//! Log stream broadcaster for tailcast
//!
//! This crate accepts WebSocket subscribers, resolves each request to a log
//! file, and pushes newly appended lines to the connection that asked for
//! them until it disconnects.

mod broadcaster;
mod config;
mod query;
mod registry;

pub use broadcaster::Broadcaster;
pub use config::ServerConfig;
pub use query::{Rejection, parse_selector};
pub use registry::{ConnectionInfo, ConnectionRegistry};

// Re-export types used in our public API
pub use tailcast_types::{ClientMessage, ConnectionId, ServerMessage, StreamKind, StreamSelector};
