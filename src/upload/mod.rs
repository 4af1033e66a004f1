//! Upload module
//!
//! Multipart upload orchestration: the [`MultipartUploader`] drives
//! initiate → open → transfer parts → complete, aborting the session on any
//! failure or cancellation after it was created.

use crate::broker::BrokerError;
use crate::chunk::{ChunkError, UploadSource};
use crate::config::Config;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod coordinator;
pub mod progress;
pub mod transfer;

pub use crate::broker::{UploadResult, UploadedPart};
pub use coordinator::MultipartUploader;
pub use progress::{ProgressInfo, ProgressSink, ProgressTracker};
pub use transfer::{PartOutcome, PartUploader, TransferSettings};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Source error: {0}")]
    Source(#[from] ChunkError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Part {part_number} rejected (HTTP {status:?}): {message}")]
    PartRejected {
        part_number: u32,
        status: Option<u16>,
        message: String,
    },

    #[error("Part {part_number} failed after {attempts} attempts (last HTTP {last_status:?}): {message}")]
    RetriesExhausted {
        part_number: u32,
        attempts: u32,
        last_status: Option<u16>,
        message: String,
    },

    #[error("HTTP client error: {0}")]
    Client(#[source] reqwest::Error),
}

/// Per-upload parameters
#[derive(Clone)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    /// Overrides the configured part size for this upload
    pub part_size: Option<u64>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSink>,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            part_size: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receive `(bytes_sent, total_bytes, info)` as parts are transferred
    pub fn with_progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(u64, u64, &ProgressInfo) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(sink));
        self
    }
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("part_size", &self.part_size)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Upload `source` with a one-off uploader built from `config`.
///
/// Returns `Ok(None)` when the request's cancellation token was raised; the
/// remote session has been aborted in that case.
pub async fn multipart_upload(
    source: UploadSource,
    config: &Config,
    request: UploadRequest,
) -> Result<Option<UploadResult>, UploadError> {
    MultipartUploader::new(config)?.upload(source, request).await
}
