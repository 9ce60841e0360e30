//! pm2 integration
//!
//! Log paths are read from `pm2 jlist`, which prints every managed process
//! as a JSON array.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::resolver::{LogPathResolver, ResolveError};
use tailcast_types::{StreamKind, StreamSelector};

/// One entry of `pm2 jlist`
#[derive(Clone, Debug, Deserialize)]
pub struct Pm2Process {
    pub name: String,
    #[serde(default)]
    pub pm_id: Option<u64>,
    #[serde(default)]
    pub pm2_env: Pm2Env,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Pm2Env {
    #[serde(default)]
    pub pm_out_log_path: Option<PathBuf>,
    #[serde(default)]
    pub pm_err_log_path: Option<PathBuf>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Pm2Process {
    /// Match by process name or numeric pm2 id
    fn matches(&self, process: &str) -> bool {
        self.name == process || self.pm_id.is_some_and(|id| id.to_string() == process)
    }

    /// Log file of one stream; the other stream may be unset
    pub fn log_path(&self, kind: StreamKind) -> Result<PathBuf, ResolveError> {
        let path = match kind {
            StreamKind::Stdout => &self.pm2_env.pm_out_log_path,
            StreamKind::Stderr => &self.pm2_env.pm_err_log_path,
        };
        path.clone()
            .ok_or_else(|| ResolveError::MissingLogPath(self.name.clone(), kind))
    }
}

/// Parse `pm2 jlist` output.
///
/// pm2 may print banner lines before the JSON, so only the last line that
/// opens an array is parsed.
pub fn parse_jlist(output: &str) -> Result<Vec<Pm2Process>, serde_json::Error> {
    let json = output
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('['))
        .unwrap_or(output);
    serde_json::from_str(json.trim())
}

/// Resolves log paths by querying the local pm2 daemon
#[derive(Clone, Debug)]
pub struct Pm2Resolver {
    binary: PathBuf,
}

impl Pm2Resolver {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// List all processes known to pm2
    pub async fn list(&self) -> Result<Vec<Pm2Process>, ResolveError> {
        let output = Command::new(&self.binary)
            .arg("jlist")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ResolveError::Spawn)?;

        if !output.status.success() {
            return Err(ResolveError::CommandFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_jlist(&stdout)?)
    }
}

impl Default for Pm2Resolver {
    fn default() -> Self {
        Self::new("pm2")
    }
}

#[async_trait]
impl LogPathResolver for Pm2Resolver {
    async fn resolve(&self, selector: &StreamSelector) -> Result<PathBuf, ResolveError> {
        let processes = self.list().await?;
        tracing::debug!(%selector, known = processes.len(), "pm2: resolving process");

        processes
            .iter()
            .find(|p| p.matches(&selector.process))
            .ok_or_else(|| ResolveError::NotFound(selector.process.clone()))?
            .log_path(selector.kind)
    }
}
