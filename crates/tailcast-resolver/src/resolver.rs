use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;

use tailcast_types::{ProcessLogPaths, StreamKind, StreamSelector};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("process '{0}' not found")]
    NotFound(String),

    #[error("failed to run process manager: {0}")]
    Spawn(#[source] io::Error),

    #[error("process manager exited with {status}: {stderr}")]
    CommandFailed { status: ExitStatus, stderr: String },

    #[error("unexpected process manager output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("process '{0}' has no {1} log file configured")]
    MissingLogPath(String, StreamKind),
}

impl ResolveError {
    /// True when the process is simply unknown, as opposed to a lookup failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::MissingLogPath(..))
    }
}

/// Maps a requested process stream to the file backing it
#[async_trait]
pub trait LogPathResolver: Send + Sync {
    async fn resolve(&self, selector: &StreamSelector) -> Result<PathBuf, ResolveError>;
}

/// Fixed table of process log paths
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    processes: HashMap<String, ProcessLogPaths>,
}

impl StaticResolver {
    pub fn new(processes: HashMap<String, ProcessLogPaths>) -> Self {
        Self { processes }
    }

    pub fn insert(&mut self, name: impl Into<String>, paths: ProcessLogPaths) {
        self.processes.insert(name.into(), paths);
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

#[async_trait]
impl LogPathResolver for StaticResolver {
    async fn resolve(&self, selector: &StreamSelector) -> Result<PathBuf, ResolveError> {
        self.processes
            .get(&selector.process)
            .map(|paths| paths.path_for(selector.kind).to_path_buf())
            .ok_or_else(|| ResolveError::NotFound(selector.process.clone()))
    }
}

/// Tries each resolver in order, moving on only when a process is not found
pub struct ChainResolver {
    resolvers: Vec<Box<dyn LogPathResolver>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
        }
    }

    pub fn with(mut self, resolver: impl LogPathResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }
}

impl Default for ChainResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogPathResolver for ChainResolver {
    async fn resolve(&self, selector: &StreamSelector) -> Result<PathBuf, ResolveError> {
        for resolver in &self.resolvers {
            match resolver.resolve(selector).await {
                Err(e) if e.is_not_found() => continue,
                other => return other,
            }
        }
        Err(ResolveError::NotFound(selector.process.clone()))
    }
}
