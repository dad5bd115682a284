//! Engine configuration

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Default size of a streamed file chunk
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration shared by every execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Parent directory under which per-request workspaces are created
    pub workspace_root: PathBuf,

    /// Timeout applied when a request does not carry one
    pub default_timeout: Option<Duration>,

    /// Upper bound on any requested timeout
    pub max_timeout: Option<Duration>,

    /// Chunk size used when streaming output files
    pub chunk_size: usize,

    /// Pass the daemon's environment to children
    pub inherit_env: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir(),
            default_timeout: None,
            max_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            inherit_env: true,
        }
    }
}

impl ExecutionConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ExecutionConfigBuilder {
        ExecutionConfigBuilder::default()
    }

    /// Timeout actually enforced for a request asking for `requested`
    #[must_use]
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        let timeout = requested.or(self.default_timeout)?;
        Some(match self.max_timeout {
            Some(max) => timeout.min(max),
            None => timeout,
        })
    }
}

/// Builder for ExecutionConfig
#[derive(Debug, Default)]
pub struct ExecutionConfigBuilder {
    config: ExecutionConfig,
}

impl ExecutionConfigBuilder {
    #[must_use]
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = path.into();
        self
    }

    #[must_use]
    pub const fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn max_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.max_timeout = timeout;
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes.max(1);
        self
    }

    #[must_use]
    pub const fn inherit_env(mut self, inherit: bool) -> Self {
        self.config.inherit_env = inherit;
        self
    }

    #[must_use]
    pub fn build(self) -> ExecutionConfig {
        self.config
    }
}

/// Sizing of the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker slots, i.e. concurrent child processes
    pub num_workers: usize,

    /// Reject submissions once this many are waiting for a slot
    pub max_queue_depth: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_queue_depth: None,
        }
    }
}

/// One worker per available core
#[must_use]
pub fn default_num_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_prefers_request_and_clamps() {
        let config = ExecutionConfig::builder()
            .default_timeout(Some(Duration::from_secs(10)))
            .max_timeout(Some(Duration::from_secs(30)))
            .build();

        assert_eq!(config.effective_timeout(None), Some(Duration::from_secs(10)));
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(2))),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(300))),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn no_timeout_by_default() {
        assert_eq!(ExecutionConfig::default().effective_timeout(None), None);
        assert!(PoolConfig::default().num_workers >= 1);
    }
}
