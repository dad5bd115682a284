//! # cmdhost-core
//!
//! Command execution engine for running untrusted argv commands in
//! throwaway directories.
//!
//! This crate provides:
//! - Ephemeral workspaces materializing caller-supplied input files
//! - A process runner with wall-clock timeouts, signal classification and rusage
//! - Output file collection that never reads outside the workspace
//! - A bounded worker pool sized to the host's cores
//! - Streaming of results as `multipart/mixed`, deleting the workspace afterwards

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod collector;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod result;
pub mod runner;
pub mod stream;
pub mod workspace;

pub use config::{ExecutionConfig, PoolConfig};
pub use error::CmdhostError;
pub use pool::WorkerPool;
pub use protocol::ExecutionRequest;
pub use result::{ExecutionResult, ExecutionStatus};
pub use workspace::Workspace;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, CmdhostError>;
