//! Presigned URL broker client
//!
//! The broker is a backend that holds the object-store credentials and hands
//! out presigned part URLs. All calls live under `<endpoint>/objstorage/`:
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | Initiate | `POST creatempu?bucket=&key=` | `InitiateMultipartUploadResult` XML |
//! | Open | `GET parturls?bucket=&key=&uploadId=&numParts=` | JSON `[{partNumber, url}]` |
//! | Complete | `POST completempu?bucket=&key=&uploadId=` | `CompleteMultipartUploadResult` XML |
//! | Abort | `DELETE abortmpu?Bucket=&Key=&UploadId=` | ignored |
//!
//! None of these calls are retried here; retry policy belongs to part
//! transfers only.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod xml;

/// Length of response body kept in error messages
const BODY_PREVIEW_LEN: usize = 512;

/// Broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("{operation} failed: {code}: {message}")]
    Remote {
        operation: &'static str,
        code: String,
        message: String,
    },

    #[error("Malformed {operation} response: {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} response is missing {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    #[error("Invalid part number {0:?}: must be a positive integer")]
    InvalidPartNumber(String),

    #[error("Invalid argument: cannot complete a multipart upload with no parts")]
    EmptyManifest,
}

/// A live multipart upload session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub total_bytes: u64,
}

/// Presigned URL for one part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUrl {
    pub part_number: u32,
    pub url: String,
}

/// A transferred part, as referenced by the completion manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Final object details reported by the store on completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub location: String,
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub checksum_crc64nvme: Option<String>,
    pub checksum_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPartNumber {
    Number(i64),
    Text(String),
}

impl RawPartNumber {
    fn coerce(self) -> Result<u32, BrokerError> {
        let parsed = match &self {
            RawPartNumber::Number(n) => u32::try_from(*n).ok(),
            RawPartNumber::Text(s) => s.trim().parse::<u32>().ok(),
        };
        match parsed {
            Some(n) if n > 0 => Ok(n),
            _ => Err(BrokerError::InvalidPartNumber(match self {
                RawPartNumber::Number(n) => n.to_string(),
                RawPartNumber::Text(s) => s,
            })),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPartUrl {
    part_number: RawPartNumber,
    url: String,
}

/// Parse the `parturls` JSON body. Order is preserved as received.
pub fn parse_part_urls(body: &str) -> Result<Vec<PartUrl>, BrokerError> {
    let raw: Vec<RawPartUrl> = serde_json::from_str(body).map_err(|e| BrokerError::Malformed {
        operation: "parturls",
        message: e.to_string(),
    })?;

    raw.into_iter()
        .map(|entry| {
            Ok(PartUrl {
                part_number: entry.part_number.coerce()?,
                url: entry.url,
            })
        })
        .collect()
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_LEN).collect()
}

/// Broker HTTP client
#[derive(Debug, Clone)]
pub struct BrokerClient {
    endpoint: String,
    http: reqwest::Client,
}

impl BrokerClient {
    /// Create a broker client sharing an existing HTTP client
    pub fn with_client(endpoint: &str, http: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Base URL of the broker
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/objstorage/{}", self.endpoint, operation)
    }

    async fn check(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BrokerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BrokerError::Status {
            operation,
            status: status.as_u16(),
            body: preview(&body),
        })
    }

    /// Start a multipart upload session
    #[tracing::instrument(
        name = "mpu.initiate",
        skip(self),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            s3.upload_id = tracing::field::Empty
        ),
        err
    )]
    pub async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        total_bytes: u64,
    ) -> Result<UploadSession, BrokerError> {
        let response = self
            .http
            .post(self.url("creatempu"))
            .query(&[("bucket", bucket), ("key", key)])
            .send()
            .await?;
        let body = Self::check("creatempu", response).await?.text().await?;
        let upload_id = xml::parse_initiate(&body)?;

        tracing::Span::current().record("s3.upload_id", upload_id.as_str());
        tracing::info!(upload_id = %upload_id, total_bytes, "Created multipart upload");

        Ok(UploadSession {
            upload_id,
            bucket: bucket.to_string(),
            key: key.to_string(),
            total_bytes,
        })
    }

    /// Fetch one presigned URL per part
    #[tracing::instrument(
        name = "mpu.part_urls",
        skip(self, session),
        fields(s3.upload_id = %session.upload_id),
        err
    )]
    pub async fn part_urls(
        &self,
        session: &UploadSession,
        num_parts: u64,
    ) -> Result<Vec<PartUrl>, BrokerError> {
        let num_parts = num_parts.to_string();
        let response = self
            .http
            .get(self.url("parturls"))
            .query(&[
                ("bucket", session.bucket.as_str()),
                ("key", session.key.as_str()),
                ("uploadId", session.upload_id.as_str()),
                ("numParts", num_parts.as_str()),
            ])
            .send()
            .await?;
        let body = Self::check("parturls", response).await?.text().await?;
        let urls = parse_part_urls(&body)?;

        tracing::debug!(count = urls.len(), "Received presigned part URLs");
        Ok(urls)
    }

    /// Finalize the upload from its ordered parts
    #[tracing::instrument(
        name = "mpu.complete",
        skip(self, session, parts),
        fields(
            s3.upload_id = %session.upload_id,
            parts_count = parts.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    pub async fn complete(
        &self,
        session: &UploadSession,
        parts: &[UploadedPart],
    ) -> Result<UploadResult, BrokerError> {
        let manifest = xml::completion_manifest(parts)?;
        let response = self
            .http
            .post(self.url("completempu"))
            .query(&[
                ("bucket", session.bucket.as_str()),
                ("key", session.key.as_str()),
                ("uploadId", session.upload_id.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(manifest)
            .send()
            .await?;
        let body = Self::check("completempu", response).await?.text().await?;
        let result = xml::parse_complete(&body)?;

        tracing::Span::current().record("s3.etag", result.etag.as_str());
        tracing::info!(location = %result.location, "Completed multipart upload");
        Ok(result)
    }

    /// Release the session and any parts stored so far
    #[tracing::instrument(
        name = "mpu.abort",
        skip(self, session),
        fields(s3.upload_id = %session.upload_id),
        err
    )]
    pub async fn abort(&self, session: &UploadSession) -> Result<(), BrokerError> {
        let response = self
            .http
            .delete(self.url("abortmpu"))
            .query(&[
                ("Bucket", session.bucket.as_str()),
                ("Key", session.key.as_str()),
                ("UploadId", session.upload_id.as_str()),
            ])
            .send()
            .await?;
        Self::check("abortmpu", response).await?;

        tracing::info!("Aborted multipart upload");
        Ok(())
    }
}
