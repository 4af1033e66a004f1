//! Multipart upload coordinator
//!
//! Runs one upload end to end, strictly in sequence:
//!
//! 1. initiate the session (failure propagates, nothing to clean up)
//! 2. fetch and validate one presigned URL per part
//! 3. transfer every chunk in ascending part order
//! 4. complete the upload
//!
//! Any failure after step 1, and cancellation, aborts the session before
//! returning. Abort is best-effort and never replaces the original error.

use super::progress::ProgressTracker;
use super::transfer::{PartOutcome, PartUploader, TransferSettings};
use super::{UploadError, UploadRequest, UploadResult};
use crate::broker::{BrokerClient, PartUrl, UploadSession};
use crate::chunk::{normalize_part_size, part_count, ChunkSource, UploadSource};
use crate::config::Config;
use crate::metrics;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sort part URLs and check they are exactly `1..=num_parts`
pub fn order_part_urls(mut urls: Vec<PartUrl>, num_parts: u64) -> Result<Vec<PartUrl>, UploadError> {
    urls.sort_by_key(|u| u.part_number);

    if urls.len() as u64 != num_parts {
        return Err(UploadError::Protocol(format!(
            "expected {} part URLs, broker returned {}",
            num_parts,
            urls.len()
        )));
    }

    for (i, url) in urls.iter().enumerate() {
        let expected = i as u64 + 1;
        if url.part_number as u64 != expected {
            return Err(UploadError::Protocol(format!(
                "part URLs are not contiguous: expected part {} but found {}",
                expected, url.part_number
            )));
        }
    }

    Ok(urls)
}

/// Multipart upload coordinator
///
/// Holds no per-upload state; every [`upload`](Self::upload) call owns its
/// session, so one uploader can serve concurrent uploads.
#[derive(Debug, Clone)]
pub struct MultipartUploader {
    broker: BrokerClient,
    parts: PartUploader,
}

impl MultipartUploader {
    /// Create an uploader from configuration
    pub fn new(config: &Config) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.broker.timeout_seconds))
            .build()
            .map_err(UploadError::Client)?;
        Ok(Self::with_client(
            &config.broker.endpoint,
            http,
            TransferSettings::from(&config.upload),
        ))
    }

    /// Create an uploader around an existing HTTP client
    pub fn with_client(endpoint: &str, http: reqwest::Client, settings: TransferSettings) -> Self {
        Self {
            broker: BrokerClient::with_client(endpoint, http.clone()),
            parts: PartUploader::new(http, settings),
        }
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    pub fn settings(&self) -> &TransferSettings {
        self.parts.settings()
    }

    /// Upload `source` as `request.bucket`/`request.key`.
    ///
    /// Returns `Ok(None)` when cancelled through `request.cancel`. The remote
    /// session is aborted on cancellation and on every error raised after it
    /// was initiated.
    #[tracing::instrument(
        name = "mpu.upload",
        skip(self, source, request),
        fields(
            s3.bucket = %request.bucket,
            s3.key = %request.key,
            upload.bytes = source.total_bytes()
        ),
        err
    )]
    pub async fn upload(
        &self,
        source: UploadSource,
        request: UploadRequest,
    ) -> Result<Option<UploadResult>, UploadError> {
        let started = Instant::now();
        let total_bytes = source.total_bytes();
        let desired = request.part_size.unwrap_or(self.parts.settings().part_size);
        let part_size = normalize_part_size(desired, total_bytes)?;
        let num_parts = part_count(total_bytes, part_size);

        if request.cancel.is_cancelled() {
            tracing::info!("Upload cancelled before it started");
            metrics::record_upload_cancelled(started.elapsed().as_secs_f64());
            return Ok(None);
        }

        let session = self
            .broker
            .initiate(&request.bucket, &request.key, total_bytes)
            .await?;
        tracing::info!(
            upload_id = %session.upload_id,
            part_size,
            num_parts,
            "Starting multipart upload"
        );

        let mut chunks = source.into_chunks(part_size);
        let mut tracker = ProgressTracker::new(total_bytes, request.progress.clone());
        let outcome = self
            .run_session(
                &session,
                chunks.as_mut(),
                part_size,
                num_parts,
                &mut tracker,
                &request.cancel,
            )
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(Some(result)) => {
                metrics::record_upload_completed(total_bytes, num_parts as usize, elapsed);
                Ok(Some(result))
            }
            Ok(None) => {
                tracing::info!(
                    upload_id = %session.upload_id,
                    bytes_sent = tracker.bytes_sent(),
                    "Upload cancelled, aborting session"
                );
                self.abort_quietly(&session).await;
                metrics::record_upload_cancelled(elapsed);
                Ok(None)
            }
            Err(e) => {
                tracing::error!(upload_id = %session.upload_id, error = %e, "Upload failed, aborting session");
                self.abort_quietly(&session).await;
                metrics::record_upload_failed(elapsed);
                Err(e)
            }
        }
    }

    async fn run_session(
        &self,
        session: &UploadSession,
        chunks: &mut dyn ChunkSource,
        part_size: u64,
        num_parts: u64,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Option<UploadResult>, UploadError> {
        if num_parts == 0 {
            // No URLs to open; completion refuses an empty part list
            let result = self.broker.complete(session, &[]).await?;
            return Ok(Some(result));
        }

        let urls = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            urls = self.broker.part_urls(session, num_parts) => urls?,
        };
        let urls = order_part_urls(urls, num_parts)?;

        let mut parts = Vec::with_capacity(urls.len());
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let Some(chunk) = chunks.next_chunk()? else {
                break;
            };
            let Some(part_url) = urls.get(chunk.index) else {
                return Err(UploadError::Protocol(format!(
                    "source produced more than {} parts",
                    num_parts
                )));
            };

            let outcome = self
                .parts
                .upload_part(&chunk, &part_url.url, num_parts, part_size, tracker, cancel)
                .await?;
            match outcome {
                PartOutcome::Uploaded(part) => parts.push(part),
                PartOutcome::Cancelled => return Ok(None),
            }
        }

        if parts.len() as u64 != num_parts {
            return Err(UploadError::Protocol(format!(
                "source produced {} of {} parts",
                parts.len(),
                num_parts
            )));
        }

        if cancel.is_cancelled() {
            return Ok(None);
        }

        let result = self.broker.complete(session, &parts).await?;
        Ok(Some(result))
    }

    /// Abort without failing; not tied to the cancellation token
    async fn abort_quietly(&self, session: &UploadSession) {
        match self.broker.abort(session).await {
            Ok(()) => metrics::record_abort(true),
            Err(e) => {
                metrics::record_abort(false);
                tracing::warn!(
                    upload_id = %session.upload_id,
                    error = %e,
                    "Failed to abort multipart upload"
                );
            }
        }
    }
}
