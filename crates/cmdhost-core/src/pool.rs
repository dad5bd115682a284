//! Worker pool management
//!
//! The pool owns a fixed number of worker slots. A submitted job holds a slot
//! while its workspace is populated, its process runs and its outputs are
//! collected; jobs beyond the slot count wait in FIFO order. Streaming the
//! result happens after the slot is released.

use crate::collector;
use crate::runner::{self, RunOptions};
use crate::{
    CmdhostError, ExecutionConfig, ExecutionRequest, ExecutionResult, PoolConfig, Result,
    Workspace,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// A finished job: the result plus ownership of the workspace its output
/// files live in. Dropping it deletes the workspace.
#[derive(Debug)]
pub struct Execution {
    pub result: ExecutionResult,
    pub workspace: Workspace,
}

/// Pool of worker slots bounding concurrent child processes
#[derive(Debug)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    queued: AtomicUsize,
    max_queue_depth: Option<usize>,
    accepting: AtomicBool,
    config: ExecutionConfig,
}

impl WorkerPool {
    /// Create a new worker pool
    #[must_use]
    pub fn new(pool: PoolConfig, config: ExecutionConfig) -> Self {
        let size = pool.num_workers.max(1);
        tracing::info!(
            workers = size,
            max_queue_depth = pool.max_queue_depth,
            workspace_root = ?config.workspace_root,
            "worker pool initialized"
        );

        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            queued: AtomicUsize::new(0),
            max_queue_depth: pool.max_queue_depth,
            accepting: AtomicBool::new(true),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Run one request on a worker slot.
    ///
    /// Waits for a free slot if all are busy. The slot is released when the
    /// job finishes, even if the caller stops waiting for it.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Execution> {
        request.validate()?;

        let permit = self.acquire().await?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            execute(&request, &config)
        })
        .await
        .map_err(|e| CmdhostError::Internal(format!("worker task failed: {e}")))?
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CmdhostError::ShuttingDown);
        }

        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(CmdhostError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {}
        }

        let queued = self.queued.fetch_add(1, Ordering::AcqRel);
        let _waiting = QueueSlot(&self.queued);
        if let Some(max) = self.max_queue_depth {
            if queued >= max {
                tracing::warn!(queued, max, "worker pool queue full, rejecting job");
                return Err(CmdhostError::PoolExhausted { queued });
            }
        }

        tracing::debug!(queued = queued + 1, "all worker slots busy, waiting");
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| CmdhostError::ShuttingDown)
    }

    /// Get pool status without taking a slot
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let idle = if self.slots.is_closed() {
            0
        } else {
            self.slots.available_permits().min(self.size)
        };

        PoolStatus {
            total: self.size,
            busy: self.size - idle,
            idle,
            queued: self.queued.load(Ordering::Acquire),
        }
    }

    /// Stop accepting jobs and wait for in-flight ones to release their slots
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("worker pool shutting down");
        }

        let size = u32::try_from(self.size).unwrap_or(u32::MAX);
        if let Ok(all) = self.slots.acquire_many(size).await {
            self.slots.close();
            drop(all);
            tracing::info!("worker pool stopped");
        }
    }
}

/// Decrements the queue counter when a waiter leaves, admitted or not
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Status of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
}

/// Body of a job: populate, run, collect. Runs on a blocking thread.
fn execute(request: &ExecutionRequest, config: &ExecutionConfig) -> Result<Execution> {
    let workspace = Workspace::create(&config.workspace_root)?;

    for file in &request.input_files {
        workspace.write(&file.relative_path, &file.content)?;
    }
    tracing::debug!(
        workspace = ?workspace.path(),
        files = request.input_files.len(),
        "workspace populated"
    );

    let cwd = match &request.working_subdirectory {
        Some(dir) => workspace.create_dir(dir)?,
        None => workspace.path().to_path_buf(),
    };

    let outcome = runner::run(
        &request.command,
        RunOptions {
            cwd: &cwd,
            timeout: config.effective_timeout(request.timeout),
            inherit_env: config.inherit_env,
        },
    )?;

    let collected = collector::collect(&workspace, &request.output_files);
    let status = outcome
        .status
        .with_missing_outputs(!collected.missing.is_empty());

    tracing::info!(
        command = %request.display_command(),
        %status,
        exit_code = outcome.exit_code,
        outputs = collected.files.len(),
        missing = collected.missing.len(),
        "execution finished"
    );

    let result = ExecutionResult {
        status,
        exit_code: outcome.exit_code,
        signal_num: outcome.signal_num,
        command: request.display_command(),
        stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
        execution_stats: outcome.stats,
        missing_files: collected.missing,
        output_files: collected.files,
    };

    Ok(Execution { result, workspace })
}
