//! Part transfer
//!
//! One HTTP PUT per attempt to the part's presigned URL, with bounded retry
//! and exponential backoff plus jitter.
//!
//! # Attempt classification
//!
//! | Result | Outcome |
//! |--------|---------|
//! | 2xx with `ETag` | success |
//! | 2xx without `ETag` | fatal |
//! | 408, 429, 5xx | retryable |
//! | other status | fatal |
//! | no response (connect, timeout, reset) | retryable |
//! | request could not be built | fatal |
//!
//! A part gets at most `num_retries` extra attempts beyond the first.

use super::progress::{ProgressInfo, ProgressTracker};
use super::UploadError;
use crate::broker::UploadedPart;
use crate::chunk::Chunk;
use crate::config::UploadConfig;
use crate::metrics;
use bytes::Bytes;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Size of the body slices handed to the transport; progress advances per slice
pub const UPLOAD_SLICE_SIZE: usize = 64 * 1024;

/// Length of failure response body kept in error messages
const BODY_PREVIEW_LEN: usize = 512;

/// Part size and retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    /// Desired part size before normalization
    pub part_size: u64,
    /// Extra attempts per part beyond the first
    pub num_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound of the uniform random jitter added to each delay
    pub retry_jitter: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for TransferSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            part_size: config.part_size,
            num_retries: config.num_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }
}

/// Classified result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Success {
        etag: String,
    },
    Retryable {
        status: Option<u16>,
        detail: String,
    },
    Fatal {
        status: Option<u16>,
        detail: String,
    },
}

/// Result of transferring one part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    Uploaded(UploadedPart),
    /// The cancellation token was raised; nothing more will be attempted
    Cancelled,
}

/// 408, 429 and every 5xx are worth another attempt
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub(crate) fn classify_response(
    status: StatusCode,
    etag: Option<String>,
    body: &str,
) -> AttemptOutcome {
    if status.is_success() {
        return match etag {
            Some(etag) => AttemptOutcome::Success { etag },
            None => AttemptOutcome::Fatal {
                status: Some(status.as_u16()),
                detail: "response is missing the ETag header".into(),
            },
        };
    }

    let detail = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!(
            "HTTP {}: {}",
            status,
            body.chars().take(BODY_PREVIEW_LEN).collect::<String>()
        )
    };

    if is_retryable_status(status) {
        AttemptOutcome::Retryable {
            status: Some(status.as_u16()),
            detail,
        }
    } else {
        AttemptOutcome::Fatal {
            status: Some(status.as_u16()),
            detail,
        }
    }
}

pub(crate) fn classify_transport_error(err: &reqwest::Error) -> AttemptOutcome {
    if err.is_builder() {
        AttemptOutcome::Fatal {
            status: None,
            detail: format!("invalid request: {}", err),
        }
    } else {
        AttemptOutcome::Retryable {
            status: None,
            detail: format!("transport error: {}", err),
        }
    }
}

/// Delay before extra attempt `retry` (1-based): `base * 2^(retry-1) + jitter`
pub fn backoff_delay(base: Duration, retry: u32, jitter: Duration) -> Duration {
    let factor = 1u32
        .checked_shl(retry.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).saturating_add(jitter)
}

fn sample_jitter(window: Duration) -> Duration {
    let max = window.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max))
}

/// Request body that reports how far the transport has read it
fn progress_body(bytes: Bytes, loaded: mpsc::UnboundedSender<u64>) -> reqwest::Body {
    let total = bytes.len();
    let slices = (0..total).step_by(UPLOAD_SLICE_SIZE).map(move |start| {
        let end = (start + UPLOAD_SLICE_SIZE).min(total);
        let _ = loaded.send(end as u64);
        Ok::<Bytes, std::io::Error>(bytes.slice(start..end))
    });
    reqwest::Body::wrap_stream(futures::stream::iter(slices))
}

fn extract_etag(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Transfers single parts to presigned URLs
#[derive(Debug, Clone)]
pub struct PartUploader {
    http: reqwest::Client,
    settings: TransferSettings,
}

impl PartUploader {
    pub fn new(http: reqwest::Client, settings: TransferSettings) -> Self {
        Self { http, settings }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Upload one chunk, retrying transient failures.
    ///
    /// Cancellation is checked before every attempt and interrupts both the
    /// backoff sleep and an in-flight request; it yields
    /// [`PartOutcome::Cancelled`] rather than an error.
    #[tracing::instrument(
        name = "mpu.upload_part",
        skip(self, chunk, url, tracker, cancel),
        fields(
            part_number = chunk.part_number(),
            upload.bytes = chunk.len()
        ),
        err
    )]
    pub async fn upload_part(
        &self,
        chunk: &Chunk,
        url: &str,
        num_parts: u64,
        part_size: u64,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<PartOutcome, UploadError> {
        let part_number = chunk.part_number();
        let max_attempts = self.settings.num_retries.saturating_add(1);
        let mut last_failure: Option<(Option<u16>, String)> = None;
        tracker.begin_part();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Ok(PartOutcome::Cancelled);
            }

            if attempt > 1 {
                let delay = backoff_delay(
                    self.settings.retry_base_delay,
                    attempt - 1,
                    sample_jitter(self.settings.retry_jitter),
                );
                tracing::warn!(
                    part_number,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying part upload"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(PartOutcome::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let info = ProgressInfo {
                part_number,
                num_parts,
                part_size,
                attempt,
            };
            let Some(outcome) = self.attempt(chunk, url, &info, tracker, cancel).await else {
                return Ok(PartOutcome::Cancelled);
            };

            match outcome {
                AttemptOutcome::Success { etag } => {
                    metrics::record_part_attempt("success");
                    tracing::info!(part_number, attempt, etag = %etag, "Uploaded part");
                    return Ok(PartOutcome::Uploaded(UploadedPart { part_number, etag }));
                }
                AttemptOutcome::Retryable { status, detail } => {
                    metrics::record_part_attempt("retryable");
                    tracing::warn!(part_number, attempt, status = ?status, error = %detail, "Part attempt failed");
                    last_failure = Some((status, detail));
                }
                AttemptOutcome::Fatal { status, detail } => {
                    metrics::record_part_attempt("fatal");
                    return Err(UploadError::PartRejected {
                        part_number,
                        status,
                        message: detail,
                    });
                }
            }
        }

        let (last_status, message) =
            last_failure.unwrap_or((None, "no attempt was made".to_string()));
        Err(UploadError::RetriesExhausted {
            part_number,
            attempts: max_attempts,
            last_status,
            message,
        })
    }

    /// One PUT. `None` when cancelled mid-flight.
    async fn attempt(
        &self,
        chunk: &Chunk,
        url: &str,
        info: &ProgressInfo,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Option<AttemptOutcome> {
        tracker.begin_attempt();

        let (loaded_tx, mut loaded_rx) = mpsc::unbounded_channel();
        let send = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, chunk.bytes.len())
            .body(progress_body(chunk.bytes.clone(), loaded_tx))
            .send();
        tokio::pin!(send);

        // Progress is reported from here, not from the transport task
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = &mut send => break result,
                Some(loaded) = loaded_rx.recv() => tracker.on_loaded(loaded, info),
            }
        };
        while let Ok(loaded) = loaded_rx.try_recv() {
            tracker.on_loaded(loaded, info);
        }
        tracing::debug!(
            part_number = info.part_number,
            attempt = info.attempt,
            loaded = tracker.per_part_loaded(),
            bytes_sent = tracker.bytes_sent(),
            "Part body sent"
        );

        let outcome = match result {
            Err(e) => classify_transport_error(&e),
            Ok(response) => {
                let status = response.status();
                let etag = extract_etag(&response);
                let body = if status.is_success() {
                    String::new()
                } else {
                    response.text().await.unwrap_or_default()
                };
                classify_response(status, etag, &body)
            }
        };
        Some(outcome)
    }
}
