//! Presign Uploadr Library
//!
//! Multipart uploads to S3-compatible object stores through a broker that
//! hands out presigned part URLs.
//!
//! # Features
//!
//! - **Sequential MPU**: initiate, open, transfer parts in order, complete
//! - **No Leaks**: every failure or cancellation after initiate aborts the session
//! - **Retries**: 408/429/5xx and network drops retried with backoff and jitter
//! - **Progress**: cumulative byte counts that never double-count retried bytes
//! - **Archives**: stream a JSON metadata record plus files as one tar object
//!
//! # Example
//!
//! ```no_run
//! use presign_uploadr::{chunk::UploadSource, config::Config, upload::UploadRequest, MultipartUploader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let uploader = MultipartUploader::new(&config)?;
//!
//!     let source = UploadSource::file("reads.fastq.gz")?;
//!     let request = UploadRequest::new("sequencing", "runs/42/reads.fastq.gz")
//!         .with_progress(|sent, total, _| println!("{}/{}", sent, total));
//!
//!     match uploader.upload(source, request).await? {
//!         Some(result) => println!("Uploaded to {}", result.location),
//!         None => println!("Cancelled"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod chunk;
pub mod config;
pub mod metrics;
pub mod upload;

// Re-export commonly used types
pub use chunk::UploadSource;
pub use config::Config;
pub use upload::{multipart_upload, MultipartUploader, UploadError, UploadRequest, UploadResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
