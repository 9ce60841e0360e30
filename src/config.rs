//! Configuration file
//!
//! Settings live in `~/.tailcast/config.toml`. Every section and key is
//! optional; command-line flags override whatever the file says.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use tailcast_resolver::{ProcessLogPaths, StaticResolver};
use tailcast_server::ServerConfig;
use tailcast_tail::TailConfig;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub tail: TailSection,
    pub resolver: ResolverSection,
    /// Processes with fixed log locations, keyed by name
    pub processes: HashMap<String, ProcessEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    /// Seconds between WebSocket pings; 0 disables them
    pub heartbeat_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            endpoint: defaults.endpoint,
            heartbeat_secs: defaults.heartbeat_interval.map_or(0, |d| d.as_secs()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TailSection {
    pub debounce_ms: u64,
    /// 0 disables the fallback poll
    pub rescan_interval_ms: u64,
    pub max_read_bytes: usize,
}

impl Default for TailSection {
    fn default() -> Self {
        let defaults = TailConfig::default();
        Self {
            debounce_ms: defaults.debounce.as_millis() as u64,
            rescan_interval_ms: defaults.rescan_interval.map_or(0, |d| d.as_millis() as u64),
            max_read_bytes: defaults.max_read_bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSection {
    pub pm2_bin: PathBuf,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            pm2_bin: PathBuf::from("pm2"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessEntry {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(home.join(".tailcast").join("config.toml"))
    }

    /// Load from an explicit path, or from the default location if present.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            endpoint: self.server.endpoint.clone(),
            heartbeat_interval: non_zero(Duration::from_secs(self.server.heartbeat_secs)),
        }
    }

    pub fn tail_config(&self) -> TailConfig {
        TailConfig {
            debounce: Duration::from_millis(self.tail.debounce_ms),
            rescan_interval: non_zero(Duration::from_millis(self.tail.rescan_interval_ms)),
            max_read_bytes: self.tail.max_read_bytes.max(1),
        }
    }

    pub fn static_resolver(&self) -> StaticResolver {
        let mut resolver = StaticResolver::default();
        for (name, entry) in &self.processes {
            resolver.insert(
                name.clone(),
                ProcessLogPaths::new(entry.stdout.clone(), entry.stderr.clone()),
            );
        }
        resolver
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
