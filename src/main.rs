//! Presign Uploadr - multipart uploader for presigned-URL brokers
//!
//! Uploads a single file, or a tar archive of a metadata record plus files,
//! through the broker configured in the YAML config.

use anyhow::Context;
use clap::{Parser, Subcommand};
use presign_uploadr::{
    chunk::{ArchivePacker, UploadSource},
    config::Config,
    metrics,
    upload::{MultipartUploader, UploadRequest},
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Exit status for an upload cancelled with Ctrl-C
const EXIT_CANCELLED: i32 = 130;

/// Presign Uploadr - multipart uploads through a presigned-URL broker
#[derive(Parser, Debug)]
#[command(name = "presign-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write Prometheus metrics to this file when the upload ends
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload one file as-is
    File {
        /// File to upload
        path: PathBuf,

        #[command(flatten)]
        target: Target,
    },
    /// Pack a metadata record and files into a tar archive and upload it
    Archive {
        /// JSON file holding the metadata record
        #[arg(short, long)]
        metadata: PathBuf,

        /// Files placed under files/ in the archive
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Destination bucket
    #[arg(short, long)]
    bucket: String,

    /// Destination object key
    #[arg(short, long)]
    key: String,

    /// Desired part size in bytes (raised to S3 limits as needed)
    #[arg(long)]
    part_size: Option<u64>,
}

fn build_source(command: Command) -> anyhow::Result<(UploadSource, Target)> {
    match command {
        Command::File { path, target } => {
            let source = UploadSource::file(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok((source, target))
        }
        Command::Archive {
            metadata,
            files,
            target,
        } => {
            let raw = std::fs::read_to_string(&metadata)
                .with_context(|| format!("Failed to read {}", metadata.display()))?;
            let record: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", metadata.display()))?;

            let mut packer = ArchivePacker::new(&record)?;
            for file in &files {
                packer
                    .add_file(file)
                    .with_context(|| format!("Failed to add {}", file.display()))?;
            }
            Ok((UploadSource::Archive(packer), target))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Presign Uploadr v{}", presign_uploadr::VERSION);

    // Load configuration
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    info!("Loaded configuration from {:?}", args.config);

    let (source, target) = build_source(args.command)?;
    info!(bytes = source.total_bytes(), "Prepared upload source");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling upload");
            ctrl_c.cancel();
        }
    });

    let last_percent = Arc::new(AtomicU64::new(u64::MAX));
    let mut request = UploadRequest::new(target.bucket, target.key)
        .with_cancellation(cancel)
        .with_progress(move |sent, total, part| {
            let percent = if total == 0 { 100 } else { sent * 100 / total };
            if last_percent.swap(percent, Ordering::Relaxed) != percent {
                info!(
                    bytes_sent = sent,
                    total_bytes = total,
                    part_number = part.part_number,
                    num_parts = part.num_parts,
                    attempt = part.attempt,
                    "Upload progress {}%",
                    percent
                );
            }
        });
    if let Some(part_size) = target.part_size {
        request = request.with_part_size(part_size);
    }

    let uploader = MultipartUploader::new(&config)?;
    let outcome = uploader.upload(source, request).await;

    if config.metrics.enabled {
        if let Some(path) = &args.metrics_out {
            std::fs::write(path, metrics::render())
                .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        }
    }

    match outcome? {
        Some(result) => {
            info!(
                location = %result.location,
                etag = %result.etag,
                "Upload complete"
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        None => {
            warn!("Upload cancelled");
            std::process::exit(EXIT_CANCELLED);
        }
    }
}
