//! Daemon configuration

use cmdhost_core::{ExecutionConfig, PoolConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

/// Largest request body accepted by default (base64 inflates uploads by a third)
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Error, Debug)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the HTTP server listens on
    pub bind: SocketAddr,

    /// Maximum size of a `/run-command` body
    pub max_body_bytes: usize,

    /// Worker pool sizing
    pub pool: PoolConfig,

    /// Per-execution settings
    pub execution: ExecutionConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            pool: PoolConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Defaults overridden by `CMDHOST_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`DaemonConfig::from_env`] but reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bind) = parse(&lookup, "CMDHOST_BIND")? {
            config.bind = bind;
        }
        if let Some(workers) = parse::<usize>(&lookup, "CMDHOST_WORKERS")? {
            if workers == 0 {
                return Err(ConfigError {
                    key: "CMDHOST_WORKERS",
                    value: "0".into(),
                    reason: "at least one worker is required".into(),
                });
            }
            config.pool.num_workers = workers;
        }
        if let Some(depth) = parse(&lookup, "CMDHOST_MAX_QUEUE")? {
            config.pool.max_queue_depth = Some(depth);
        }
        if let Some(root) = lookup("CMDHOST_WORKSPACE_ROOT") {
            config.execution.workspace_root = PathBuf::from(root);
        }
        if let Some(timeout) = parse_secs(&lookup, "CMDHOST_DEFAULT_TIMEOUT_SECS")? {
            config.execution.default_timeout = Some(timeout);
        }
        if let Some(timeout) = parse_secs(&lookup, "CMDHOST_MAX_TIMEOUT_SECS")? {
            config.execution.max_timeout = Some(timeout);
        }
        if let Some(bytes) = parse(&lookup, "CMDHOST_MAX_BODY_BYTES")? {
            config.max_body_bytes = bytes;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError {
                key,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(secs) = parse::<f64>(lookup, key)? else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| ConfigError {
            key,
            value: secs.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = DaemonConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind.to_string(), DEFAULT_BIND);
        assert!(config.pool.num_workers >= 1);
        assert_eq!(config.pool.max_queue_depth, None);
        assert_eq!(config.execution.default_timeout, None);
    }

    #[test]
    fn environment_overrides() {
        let config = DaemonConfig::from_lookup(lookup(&[
            ("CMDHOST_BIND", "0.0.0.0:9000"),
            ("CMDHOST_WORKERS", "3"),
            ("CMDHOST_MAX_QUEUE", "10"),
            ("CMDHOST_WORKSPACE_ROOT", "/srv/cmdhost"),
            ("CMDHOST_DEFAULT_TIMEOUT_SECS", "2.5"),
            ("CMDHOST_MAX_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.pool.num_workers, 3);
        assert_eq!(config.pool.max_queue_depth, Some(10));
        assert_eq!(config.execution.workspace_root, PathBuf::from("/srv/cmdhost"));
        assert_eq!(config.execution.default_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.execution.max_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn rejects_garbage() {
        let err = DaemonConfig::from_lookup(lookup(&[("CMDHOST_WORKERS", "many")])).unwrap_err();
        assert_eq!(err.key, "CMDHOST_WORKERS");
        assert!(DaemonConfig::from_lookup(lookup(&[("CMDHOST_WORKERS", "0")])).is_err());
        assert!(DaemonConfig::from_lookup(lookup(&[("CMDHOST_MAX_TIMEOUT_SECS", "-1")])).is_err());
    }
}
