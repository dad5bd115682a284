//! Request types and the JSON wire format of the HTTP service

use crate::workspace::normalize;
use crate::{CmdhostError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// A file to materialize in the workspace before running the command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub relative_path: String,
    pub content: Vec<u8>,
}

/// Request to execute one command. Immutable once submitted.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// argv; the first element is the executable, never run through a shell
    pub command: Vec<String>,
    /// Files written into the workspace before execution
    pub input_files: Vec<InputFile>,
    /// Paths to return after execution, in order; may repeat or not exist
    pub output_files: Vec<String>,
    /// Wall-clock limit for the child process
    pub timeout: Option<Duration>,
    /// Directory (relative to the workspace) to run in
    pub working_subdirectory: Option<String>,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn input_file(mut self, relative_path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.input_files.push(InputFile {
            relative_path: relative_path.into(),
            content: content.into(),
        });
        self
    }

    #[must_use]
    pub fn output_file(mut self, relative_path: impl Into<String>) -> Self {
        self.output_files.push(relative_path.into());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn working_subdirectory(mut self, relative_path: impl Into<String>) -> Self {
        self.working_subdirectory = Some(relative_path.into());
        self
    }

    /// The argv joined with spaces, for reporting
    #[must_use]
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }

    /// Reject anything that must not reach the process runner
    pub fn validate(&self) -> Result<()> {
        let Some(program) = self.command.first() else {
            return Err(CmdhostError::InvalidRequest("command is empty".into()));
        };
        if program.is_empty() {
            return Err(CmdhostError::InvalidRequest("executable name is empty".into()));
        }
        if self.command.iter().any(|arg| arg.contains('\0')) {
            return Err(CmdhostError::InvalidRequest(
                "command arguments must not contain NUL bytes".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.input_files.len());
        for file in &self.input_files {
            let path = normalize(&file.relative_path)?;
            if path.as_os_str().is_empty() {
                return Err(CmdhostError::InvalidPath(format!(
                    "{:?} does not name a file",
                    file.relative_path
                )));
            }
            if !seen.insert(path) {
                return Err(CmdhostError::InvalidRequest(format!(
                    "input file {:?} given more than once",
                    file.relative_path
                )));
            }
        }
        // A file cannot also be the parent directory of another input.
        for path in &seen {
            if let Some(parent) = path.ancestors().skip(1).find(|a| seen.contains(*a)) {
                return Err(CmdhostError::InvalidRequest(format!(
                    "input file {} is also used as the directory of {}",
                    parent.display(),
                    path.display()
                )));
            }
        }

        for path in &self.output_files {
            normalize(path)?;
        }
        if let Some(dir) = &self.working_subdirectory {
            normalize(dir)?;
        }

        Ok(())
    }
}

/// Input file as carried on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireInputFile {
    pub relative_path: String,
    pub content_base64: String,
}

impl WireInputFile {
    #[must_use]
    pub fn encode(relative_path: impl Into<String>, content: &[u8]) -> Self {
        Self {
            relative_path: relative_path.into(),
            content_base64: BASE64.encode(content),
        }
    }
}

/// JSON body of `POST /run-command`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCommandRequest {
    #[serde(alias = "arguments")]
    pub command: Vec<String>,

    #[serde(default)]
    pub input_files: Vec<WireInputFile>,

    #[serde(default)]
    pub output_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl TryFrom<RunCommandRequest> for ExecutionRequest {
    type Error = CmdhostError;

    fn try_from(wire: RunCommandRequest) -> Result<Self> {
        let timeout = wire
            .timeout_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    CmdhostError::InvalidRequest(format!("invalid timeout {secs}: {e}"))
                })
            })
            .transpose()?;

        let input_files = wire
            .input_files
            .into_iter()
            .map(|file| {
                let content = BASE64.decode(file.content_base64.as_bytes()).map_err(|e| {
                    CmdhostError::InvalidRequest(format!(
                        "input file {:?} is not valid base64: {e}",
                        file.relative_path
                    ))
                })?;
                Ok(InputFile {
                    relative_path: file.relative_path,
                    content,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let request = Self {
            command: wire.command,
            input_files,
            output_files: wire.output_files,
            timeout,
            working_subdirectory: wire.working_directory,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Output file inlined in a buffered JSON response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedOutputFile {
    pub relative_path: String,
    pub content_base64: String,
}

impl EncodedOutputFile {
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64.decode(self.content_base64.as_bytes()).map_err(|e| {
            CmdhostError::Internal(format!("{:?} is not valid base64: {e}", self.relative_path))
        })
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub workers: usize,
    pub active_workers: usize,
    pub queued: usize,
}

/// Body of every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: String,
}
