//! Result streaming
//!
//! An [`Execution`] is turned into a `multipart/mixed` body: one
//! `application/json` metadata part, one `application/octet-stream` part per
//! output file (read from disk in chunks while the body is being sent) and a
//! closing boundary. The producer task owns the workspace and removes it once
//! the last byte is handed over, when reading fails, or when the consumer
//! goes away.

use crate::pool::Execution;
use crate::protocol::EncodedOutputFile;
use crate::result::OutputFile;
use crate::{CmdhostError, Result, Workspace};
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Chunks buffered between the producer task and the consumer
const CHANNEL_DEPTH: usize = 4;

pub const METADATA_CONTENT_TYPE: &str = "application/json";
pub const FILE_CONTENT_TYPE: &str = "application/octet-stream";

/// A lazily produced `multipart/mixed` body
#[derive(Debug)]
pub struct MultipartStream {
    boundary: String,
    body: ReceiverStream<io::Result<Bytes>>,
}

impl MultipartStream {
    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the response's `Content-Type` header
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }

    /// The body as a stream of chunks; an `Err` item means the body was cut short
    #[must_use]
    pub fn into_body(self) -> ReceiverStream<io::Result<Bytes>> {
        self.body
    }
}

/// Start streaming `execution`. Must be called from within a tokio runtime.
///
/// The metadata is serialized before anything is spawned, so a failure here
/// is reported to the caller and the workspace is dropped right away.
pub fn stream(mut execution: Execution, chunk_size: usize) -> Result<MultipartStream> {
    let metadata = serde_json::to_vec(&execution.result)
        .map_err(|e| CmdhostError::Internal(format!("failed to encode metadata: {e}")))?;
    let files = execution.result.take_output_files();
    let boundary = format!("cmdhost-{}", uuid::Uuid::new_v4().simple());

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let producer = Producer {
        tx,
        boundary: boundary.clone(),
        chunk_size: chunk_size.max(1),
    };
    let workspace = execution.workspace;

    tokio::spawn(async move {
        match producer.run(metadata, &files).await {
            Ok(()) => tracing::debug!(files = files.len(), "result streamed"),
            Err(Abort::Disconnected) => {
                tracing::info!("client went away before the result was fully sent");
            }
            Err(Abort::Io(e)) => {
                tracing::warn!(error = %e, "streaming aborted");
                let _ = producer.tx.send(Err(e)).await;
            }
        }
        release(workspace).await;
    });

    Ok(MultipartStream {
        boundary,
        body: ReceiverStream::new(rx),
    })
}

/// Read every output file into a single JSON document (metadata plus
/// base64 contents), then remove the workspace.
///
/// A file that can no longer be read is logged and reported as missing.
pub async fn buffer_json(mut execution: Execution) -> Result<serde_json::Value> {
    let mut encoded = Vec::with_capacity(execution.result.output_files.len());
    for file in execution.result.take_output_files() {
        match tokio::fs::read(&file.path).await {
            Ok(content) => encoded.push(EncodedOutputFile {
                relative_path: file.relative_path,
                content_base64: base64_encode(&content),
            }),
            Err(e) => {
                tracing::warn!(path = %file.relative_path, error = %e, "failed to read output file");
                execution.result.missing_files.insert(file.relative_path);
            }
        }
    }
    release(execution.workspace).await;

    let result = &mut execution.result;
    result.status = result
        .status
        .with_missing_outputs(!result.missing_files.is_empty());

    let mut document = serde_json::to_value(&*result)
        .map_err(|e| CmdhostError::Internal(format!("failed to encode metadata: {e}")))?;
    document["output_files"] = serde_json::to_value(encoded)
        .map_err(|e| CmdhostError::Internal(format!("failed to encode output files: {e}")))?;
    Ok(document)
}

fn base64_encode(content: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(content)
}

/// Destroy the workspace off the async executor
async fn release(mut workspace: Workspace) {
    // If the blocking pool is gone the closure is dropped and Drop cleans up.
    let _ = tokio::task::spawn_blocking(move || workspace.destroy()).await;
}

enum Abort {
    /// The receiving side was dropped
    Disconnected,
    /// Reading an output file failed
    Io(io::Error),
}

impl From<io::Error> for Abort {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

struct Producer {
    tx: mpsc::Sender<io::Result<Bytes>>,
    boundary: String,
    chunk_size: usize,
}

impl Producer {
    async fn run(&self, metadata: Vec<u8>, files: &[OutputFile]) -> std::result::Result<(), Abort> {
        self.send(part_header(&self.boundary, METADATA_CONTENT_TYPE, None)).await?;
        self.send(metadata).await?;
        self.send(b"\r\n".as_slice()).await?;

        for file in files {
            self.send(part_header(
                &self.boundary,
                FILE_CONTENT_TYPE,
                Some(&file.relative_path),
            ))
            .await?;
            self.send_file(file).await?;
            self.send(b"\r\n".as_slice()).await?;
        }

        self.send(closing_boundary(&self.boundary)).await
    }

    async fn send_file(&self, file: &OutputFile) -> std::result::Result<(), Abort> {
        let mut handle = tokio::fs::File::open(&file.path).await?;
        loop {
            let mut chunk = BytesMut::with_capacity(self.chunk_size);
            if handle.read_buf(&mut chunk).await? == 0 {
                return Ok(());
            }
            self.send(chunk.freeze()).await?;
        }
    }

    async fn send(&self, chunk: impl Into<Bytes>) -> std::result::Result<(), Abort> {
        self.tx
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| Abort::Disconnected)
    }
}

/// Delimiter and headers opening one part
#[must_use]
pub fn part_header(boundary: &str, content_type: &str, filename: Option<&str>) -> String {
    let mut header = format!("--{boundary}\r\nContent-Type: {content_type}\r\n");
    if let Some(name) = filename {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        header.push_str(&format!(
            "Content-Disposition: attachment; filename=\"{escaped}\"\r\n"
        ));
    }
    header.push_str("\r\n");
    header
}

/// Final delimiter marking the end of the body
#[must_use]
pub fn closing_boundary(boundary: &str) -> String {
    format!("--{boundary}--\r\n")
}
