//! cmdhost-daemon - runs commands in throwaway workspaces over HTTP

use anyhow::{Context, Result};
use cmdhost_core::WorkerPool;
use cmdhost_daemon::{DaemonConfig, router};
use futures::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cmdhost=info".parse()?))
        .init();

    tracing::info!("cmdhost-daemon starting");

    let config = DaemonConfig::from_env()?;
    tracing::info!(
        workers = config.pool.num_workers,
        bind = %config.bind,
        workspace_root = ?config.execution.workspace_root,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.execution.workspace_root).with_context(|| {
        format!(
            "creating workspace root {}",
            config.execution.workspace_root.display()
        )
    })?;

    let pool = Arc::new(WorkerPool::new(config.pool.clone(), config.execution.clone()));
    let app = router(Arc::clone(&pool), config.max_body_bytes);

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(bind = %config.bind, "listening");

    let signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    let signals_handle = signals.handle();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(signals))
        .await?;

    signals_handle.close();
    pool.shutdown().await;
    tracing::info!("cmdhost-daemon stopped");

    Ok(())
}

async fn shutdown_signal(mut signals: Signals) {
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutdown requested");
    }
}
