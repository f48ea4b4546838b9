//! Bridge configuration.
//!
//! This module defines the configuration structure shared by every context a
//! [`Bridge`](super::Bridge) creates, including worker pool size, conversion
//! limits and bootstrap options.

use super::error::BridgeError;
use std::path::PathBuf;

/// Default recursion ceiling for value marshaling.
pub const DEFAULT_MAX_DEPTH: usize = 100;
/// Default number of threads servicing asynchronous calls.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Configuration for a bridge and every context it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Upper bound of the worker pool used by asynchronous operations
    pub worker_threads: usize,

    /// Maximum nesting depth followed by the value marshaler
    pub max_depth: usize,

    /// Directories prepended to the module search path of every context
    pub search_paths: Vec<PathBuf>,

    /// Source run in every fresh namespace after the standard bootstrap
    pub bootstrap_script: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            max_depth: DEFAULT_MAX_DEPTH,
            search_paths: Vec::new(),
            bootstrap_script: None,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool bound.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the marshaling depth ceiling.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Add a directory to the module search path.
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Set bootstrap script.
    pub fn with_bootstrap(mut self, script: impl Into<String>) -> Self {
        self.bootstrap_script = Some(script.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BridgeError> {
        if self.worker_threads == 0 {
            return Err(BridgeError::ArgumentType(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(BridgeError::ArgumentType(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if let Some(path) = self
            .search_paths
            .iter()
            .find(|path| path.to_str().is_none())
        {
            return Err(BridgeError::ArgumentType(format!(
                "search path {} is not valid UTF-8",
                path.display()
            )));
        }
        Ok(())
    }
}
