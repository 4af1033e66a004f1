//! Chunk sources
//!
//! Turns an upload input into an ordered, finite sequence of part-sized
//! byte ranges. Two producers share the [`ChunkSource`] contract:
//!
//! - [`BlobSlicer`] slices a random-access [`Blob`] of known size
//! - [`Rechunker`] re-buffers the forward-only [`ArchiveStream`] into
//!   fixed part-size chunks
//!
//! Only one chunk's bytes are resident at a time. A source is consumed once;
//! restarting an upload means building a new source.

use bytes::Bytes;
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

pub mod archive;
pub mod rechunk;
pub mod slicer;

pub use archive::{archive_size, ArchivePacker, ArchiveStream};
pub use rechunk::Rechunker;
pub use slicer::{Blob, BlobSlicer, FileBlob};

/// Minimum part size (5MiB) - S3 requirement for every part but the last
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum parts allowed in one multipart upload
pub const S3_MAX_PARTS: u64 = 10_000;

/// Chunk source errors
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Invalid argument: part size must be positive, got {0}")]
    InvalidPartSize(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(String),
}

/// One part-sized slice of the upload
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 0-based position in the sequence
    pub index: usize,
    /// Byte range `[start, end)` within the whole upload
    pub range: Range<u64>,
    /// True only on the final chunk
    pub is_last: bool,
    pub bytes: Bytes,
}

impl Chunk {
    /// 1-based part number used by the multipart protocol
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Pull-based producer of upload chunks.
///
/// Returns `Ok(None)` once the source is exhausted. Sources are not
/// rewindable.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError>;
}

/// Compute the effective part size for an upload.
///
/// The result is at least the desired size, at least [`S3_MIN_PART_SIZE`],
/// and large enough that `total_bytes` fits in [`S3_MAX_PARTS`] parts.
pub fn normalize_part_size(desired: u64, total_bytes: u64) -> Result<u64, ChunkError> {
    if desired == 0 {
        return Err(ChunkError::InvalidPartSize(desired));
    }

    let for_max_parts = total_bytes.div_ceil(S3_MAX_PARTS);
    Ok(desired.max(S3_MIN_PART_SIZE).max(for_max_parts))
}

/// Number of parts needed to cover `total_bytes`. Zero for an empty upload.
pub fn part_count(total_bytes: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total_bytes.div_ceil(part_size)
}

/// What gets uploaded: a blob of known size, or a packed archive.
pub enum UploadSource {
    Blob(Box<dyn Blob>),
    Archive(ArchivePacker),
}

impl UploadSource {
    /// Upload in-memory bytes
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        UploadSource::Blob(Box::new(data.into()))
    }

    /// Upload a file from disk
    pub fn file<P: AsRef<Path>>(path: P) -> Result<Self, ChunkError> {
        Ok(UploadSource::Blob(Box::new(FileBlob::open(path)?)))
    }

    /// Exact number of bytes the source will produce
    pub fn total_bytes(&self) -> u64 {
        match self {
            UploadSource::Blob(blob) => blob.size(),
            UploadSource::Archive(packer) => packer.total_bytes(),
        }
    }

    /// Turn the source into part-sized chunks
    pub fn into_chunks(self, part_size: u64) -> Box<dyn ChunkSource> {
        match self {
            UploadSource::Blob(blob) => Box::new(BlobSlicer::new(blob, part_size)),
            UploadSource::Archive(packer) => {
                let total = packer.total_bytes();
                Box::new(Rechunker::new(packer.into_stream(), part_size, total))
            }
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadSource::Blob(blob) => f.debug_tuple("Blob").field(&blob.size()).finish(),
            UploadSource::Archive(packer) => {
                f.debug_tuple("Archive").field(&packer.total_bytes()).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_normalize_rejects_zero() {
        assert!(matches!(
            normalize_part_size(0, 100),
            Err(ChunkError::InvalidPartSize(0))
        ));
    }

    #[test]
    fn test_normalize_raises_to_minimum() {
        let size = normalize_part_size(1, GIB).unwrap();
        assert!(size >= S3_MIN_PART_SIZE);
        assert!(size >= GIB.div_ceil(S3_MAX_PARTS));
        assert_eq!(size, S3_MIN_PART_SIZE);
    }

    #[test]
    fn test_normalize_keeps_larger_desired() {
        let desired = 64 * 1024 * 1024;
        assert_eq!(normalize_part_size(desired, GIB).unwrap(), desired);
    }

    #[test]
    fn test_normalize_respects_max_parts() {
        let total = 100 * GIB;
        let size = normalize_part_size(S3_MIN_PART_SIZE, total).unwrap();
        assert_eq!(size, total.div_ceil(S3_MAX_PARTS));
        assert!(part_count(total, size) <= S3_MAX_PARTS);
    }

    #[test]
    fn test_normalize_lower_bound_holds() {
        for desired in [1, 1000, S3_MIN_PART_SIZE - 1, S3_MIN_PART_SIZE + 1, 3 * GIB] {
            for total in [0, 1, GIB, 7 * GIB + 3, 60 * GIB] {
                let size = normalize_part_size(desired, total).unwrap();
                assert!(size >= desired);
                assert!(size >= S3_MIN_PART_SIZE);
                assert!(size >= total.div_ceil(S3_MAX_PARTS));
            }
        }
    }

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(0, 10), 0);
        assert_eq!(part_count(1, 10), 1);
        assert_eq!(part_count(10, 10), 1);
        assert_eq!(part_count(11, 10), 2);
    }

    #[test]
    fn test_upload_source_total_bytes() {
        let source = UploadSource::bytes(vec![1u8; 42]);
        assert_eq!(source.total_bytes(), 42);

        let packer = ArchivePacker::new(&serde_json::json!({"a": 1})).unwrap();
        let expected = packer.total_bytes();
        assert_eq!(UploadSource::Archive(packer).total_bytes(), expected);
    }
}
