//! cmdhost-daemon - HTTP front end for the command execution engine
//!
//! Requests are parsed and answered on the async runtime; each execution
//! runs on a slot of the [`cmdhost_core::WorkerPool`] owned by the daemon.

pub mod config;
pub mod server;

pub use config::DaemonConfig;
pub use server::router;
