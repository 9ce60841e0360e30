//! File tailing for tailcast
//!
//! This crate follows growing log files, reads only the bytes appended since
//! the last check, and converts the resulting lines into HTML for display.

mod reader;
mod render;
mod tracker;

pub use reader::{Growth, check_growth, split_lines};
pub use render::{ansi_to_html, render_lines};
pub use tracker::{
    FileTailTracker, SubscriberId, TailChunk, TailConfig, TailError, TailSubscription, WatchPhase,
};
