use std::time::Duration;

/// Default streaming endpoint path
pub const DEFAULT_ENDPOINT: &str = "/ws/logs";

/// Broadcaster settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Request path accepted for upgrades
    pub endpoint: String,
    /// Interval between server-initiated WebSocket pings, if any
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}
