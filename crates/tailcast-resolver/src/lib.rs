//! Process log path resolution for tailcast
//!
//! This crate maps a process name to the files holding its standard output
//! and standard error, either by asking pm2 or from a static table.

mod pm2;
mod resolver;

pub use pm2::{Pm2Env, Pm2Process, Pm2Resolver};
pub use resolver::{ChainResolver, LogPathResolver, ResolveError, StaticResolver};

// Re-export types that are used in our public API
pub use tailcast_types::{ProcessLogPaths, StreamKind, StreamSelector};
