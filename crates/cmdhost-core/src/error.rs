//! Error types for cmdhost-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmdhostError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("worker pool exhausted ({queued} requests already queued)")]
    PoolExhausted { queued: usize },

    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CmdhostError {
    /// Errors caused by the caller's request rather than by the host
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::InvalidPath(_) | Self::CommandNotFound(_)
        )
    }

    /// Errors that mean "try again later"
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::ShuttingDown)
    }
}
