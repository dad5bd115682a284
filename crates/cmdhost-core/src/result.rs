//! Execution result types

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of an execution, as reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Exited with code 0 and every requested output file exists
    Completed,
    /// Exited with a non-zero code
    Failed,
    /// Terminated by a signal
    Signaled,
    /// Terminated by the out-of-memory kill signal
    Oom,
    /// Killed after exceeding its wall-clock timeout
    Timeout,
    /// Exited with code 0 but some requested output files are absent
    MissingOutputFiles,
}

impl ExecutionStatus {
    /// Fold the output collection outcome into the process outcome.
    ///
    /// A process failure always wins over missing files; missing files only
    /// turn an otherwise successful run into `MissingOutputFiles`.
    #[must_use]
    pub const fn with_missing_outputs(self, any_missing: bool) -> Self {
        match self {
            Self::Completed if any_missing => Self::MissingOutputFiles,
            other => other,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Signaled => "SIGNALED",
            Self::Oom => "OOM",
            Self::Timeout => "TIMEOUT",
            Self::MissingOutputFiles => "MISSING_OUTPUT_FILES",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and resource usage of a child process
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Wall-clock duration
    #[serde(rename = "duration_secs", serialize_with = "as_secs_f64")]
    pub duration: Duration,

    /// Peak resident set size in bytes, 0 when unknown
    pub peak_memory_bytes: u64,

    /// User CPU time, zero when unknown
    #[serde(rename = "user_cpu_time_secs", serialize_with = "as_secs_f64")]
    pub user_cpu_time: Duration,
}

impl ExecutionStats {
    /// Stats for a run starting now; the caller fills in the rest
    #[must_use]
    pub fn started_now() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
            peak_memory_bytes: 0,
            user_cpu_time: Duration::ZERO,
        }
    }
}

/// A requested output file found in the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Path as requested by the caller
    pub relative_path: String,

    /// Absolute location inside the workspace
    pub path: PathBuf,

    /// Size observed when the file was collected
    pub size: u64,
}

/// Result of running one command.
///
/// Serializes to the metadata document: `output_files` is rendered as the
/// list of relative paths, file contents travel separately.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,

    /// Exit code, absent when the process was killed
    pub exit_code: Option<i32>,

    /// Terminating signal, if any
    pub signal_num: Option<i32>,

    /// The argv joined with spaces
    pub command: String,

    pub stdout: String,

    pub stderr: String,

    pub execution_stats: ExecutionStats,

    pub missing_files: BTreeSet<String>,

    #[serde(serialize_with = "relative_paths")]
    pub output_files: Vec<OutputFile>,
}

impl ExecutionResult {
    /// Check if execution was successful (exit code 0, all outputs present)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Move the output files out for streaming, leaving the metadata intact
    pub fn take_output_files(&mut self) -> Vec<OutputFile> {
        std::mem::take(&mut self.output_files)
    }
}

fn as_secs_f64<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

fn relative_paths<S: Serializer>(files: &[OutputFile], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(files.iter().map(|f| f.relative_path.as_str()))
}
