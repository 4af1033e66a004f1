//! Streaming tar packer
//!
//! Packs one JSON metadata record plus a set of files into a ustar stream:
//!
//! ```text
//! [header][metadata.json, padded] [header][files/a, padded] ... [2 zero blocks]
//! ```
//!
//! The exact stream length is known before a single byte is produced, which
//! the uploader needs to size parts and report progress. Entry contents are
//! read lazily in [`SEGMENT_SIZE`] pieces, so a packer over large files never
//! holds more than one segment in memory.

use super::ChunkError;
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Tar block size
pub const BLOCK_SIZE: u64 = 512;

/// Name of the metadata entry, always first in the archive
pub const METADATA_ENTRY: &str = "metadata.json";

/// Directory that file entries are placed under
pub const FILES_PREFIX: &str = "files/";

/// Largest piece of entry content yielded at once
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Exact archive length for entries of the given content sizes
pub fn archive_size<I>(entry_sizes: I) -> u64
where
    I: IntoIterator<Item = u64>,
{
    let entries: u64 = entry_sizes
        .into_iter()
        .map(|size| BLOCK_SIZE + padded_len(size))
        .sum();
    entries + 2 * BLOCK_SIZE
}

fn padded_len(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn zeros(len: u64) -> Bytes {
    Bytes::from(vec![0u8; len as usize])
}

#[derive(Debug, Clone)]
enum EntryData {
    Memory(Bytes),
    File(PathBuf),
}

#[derive(Debug, Clone)]
struct ArchiveEntry {
    header: Bytes,
    size: u64,
    data: EntryData,
}

/// Builds the list of archive entries. Headers are encoded as entries are
/// added, so invalid names fail here rather than mid-upload.
#[derive(Debug, Clone)]
pub struct ArchivePacker {
    entries: Vec<ArchiveEntry>,
    mtime: u64,
}

impl ArchivePacker {
    /// Start an archive whose first entry is `metadata` encoded as JSON
    pub fn new<T: Serialize + ?Sized>(metadata: &T) -> Result<Self, ChunkError> {
        let json = serde_json::to_vec(metadata)
            .map_err(|e| ChunkError::Archive(format!("metadata is not valid JSON: {}", e)))?;

        let mut packer = Self {
            entries: Vec::new(),
            mtime: chrono::Utc::now().timestamp().max(0) as u64,
        };
        packer.push(METADATA_ENTRY, EntryData::Memory(Bytes::from(json)), None)?;
        Ok(packer)
    }

    /// Add in-memory content as `files/<name>`
    pub fn add_bytes(&mut self, name: &str, data: impl Into<Bytes>) -> Result<(), ChunkError> {
        let path = format!("{}{}", FILES_PREFIX, name);
        self.push(&path, EntryData::Memory(data.into()), None)
    }

    /// Add a file from disk as `files/<file name>`
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ChunkError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ChunkError::Archive(format!("{} has no file name", path.display())))?;
        self.add_file_as(&name, path)
    }

    /// Add a file from disk under an explicit entry name
    pub fn add_file_as<P: AsRef<Path>>(&mut self, name: &str, path: P) -> Result<(), ChunkError> {
        let path = path.as_ref();
        let size = std::fs::metadata(path)?.len();
        let entry_path = format!("{}{}", FILES_PREFIX, name);
        self.push(&entry_path, EntryData::File(path.to_path_buf()), Some(size))
    }

    /// Number of entries including the metadata record
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Exact length of the packed stream
    pub fn total_bytes(&self) -> u64 {
        archive_size(self.entries.iter().map(|e| e.size))
    }

    pub fn into_stream(self) -> ArchiveStream {
        ArchiveStream {
            entries: self.entries.into(),
            current: None,
            trailer_written: false,
            failed: false,
        }
    }

    fn push(&mut self, path: &str, data: EntryData, size: Option<u64>) -> Result<(), ChunkError> {
        let size = match (&data, size) {
            (_, Some(size)) => size,
            (EntryData::Memory(bytes), None) => bytes.len() as u64,
            (EntryData::File(_), None) => {
                return Err(ChunkError::Archive(format!("no size for {}", path)))
            }
        };

        let mut header = tar::Header::new_ustar();
        header
            .set_path(path)
            .map_err(|e| ChunkError::Archive(format!("invalid entry name {:?}: {}", path, e)))?;
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(self.mtime);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        self.entries.push(ArchiveEntry {
            header: Bytes::copy_from_slice(header.as_bytes()),
            size,
            data,
        });
        Ok(())
    }
}

enum EntryBody {
    Memory(Bytes),
    Reader(Box<dyn Read + Send>),
}

struct OpenEntry {
    body: EntryBody,
    remaining: u64,
    padding: u64,
}

impl OpenEntry {
    fn open(entry: ArchiveEntry) -> Result<Self, ChunkError> {
        let body = match entry.data {
            EntryData::Memory(bytes) => EntryBody::Memory(bytes),
            EntryData::File(path) => EntryBody::Reader(Box::new(File::open(path)?)),
        };
        Ok(Self {
            body,
            remaining: entry.size,
            padding: padded_len(entry.size) - entry.size,
        })
    }

    fn read_segment(&mut self) -> Result<Bytes, ChunkError> {
        let want = self.remaining.min(SEGMENT_SIZE as u64) as usize;
        let segment = match &mut self.body {
            EntryBody::Memory(bytes) => bytes.split_to(want),
            EntryBody::Reader(reader) => {
                let mut buf = vec![0u8; want];
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    return Err(ChunkError::Archive(format!(
                        "entry ended {} bytes early; file changed while packing",
                        self.remaining
                    )));
                }
                buf.truncate(n);
                Bytes::from(buf)
            }
        };
        self.remaining -= segment.len() as u64;
        Ok(segment)
    }
}

/// Forward-only byte stream of a packed archive.
///
/// Segments have no particular alignment: a header block, a piece of entry
/// content, padding, or the trailer. Stops after the first error.
pub struct ArchiveStream {
    entries: VecDeque<ArchiveEntry>,
    current: Option<OpenEntry>,
    trailer_written: bool,
    failed: bool,
}

impl ArchiveStream {
    fn advance(&mut self) -> Result<Option<Bytes>, ChunkError> {
        loop {
            if let Some(open) = self.current.as_mut() {
                if open.remaining > 0 {
                    return open.read_segment().map(Some);
                }
                let padding = open.padding;
                self.current = None;
                if padding > 0 {
                    return Ok(Some(zeros(padding)));
                }
                continue;
            }

            if let Some(entry) = self.entries.pop_front() {
                let header = entry.header.clone();
                self.current = Some(OpenEntry::open(entry)?);
                return Ok(Some(header));
            }

            if !self.trailer_written {
                self.trailer_written = true;
                return Ok(Some(zeros(2 * BLOCK_SIZE)));
            }

            return Ok(None);
        }
    }
}

impl Iterator for ArchiveStream {
    type Item = Result<Bytes, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(segment)) => Some(Ok(segment)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pack(packer: ArchivePacker) -> Vec<u8> {
        let mut out = Vec::new();
        for segment in packer.into_stream() {
            out.extend_from_slice(&segment.unwrap());
        }
        out
    }

    #[test]
    fn test_archive_size_arithmetic() {
        assert_eq!(archive_size([]), 1024);
        assert_eq!(archive_size([0]), 512 + 1024);
        assert_eq!(archive_size([1]), 512 + 512 + 1024);
        assert_eq!(archive_size([512]), 512 + 512 + 1024);
        assert_eq!(archive_size([513, 10]), (512 + 1024) + (512 + 512) + 1024);
    }

    #[test]
    fn test_metadata_only_size_matches_stream() {
        let packer = ArchivePacker::new(&serde_json::json!({"pipeline": "rnaseq"})).unwrap();
        let expected = packer.total_bytes();
        assert_eq!(pack(packer).len() as u64, expected);
    }

    #[test]
    fn test_precomputed_size_matches_stream() {
        let sizes = [0usize, 1, 511, 512, 513, 70_000, 200_003];
        for count in 0..=sizes.len() {
            let mut packer = ArchivePacker::new(&serde_json::json!({"files": count})).unwrap();
            for (i, size) in sizes.iter().take(count).enumerate() {
                packer
                    .add_bytes(&format!("input-{}.bin", i), vec![7u8; *size])
                    .unwrap();
            }
            let expected = packer.total_bytes();
            let packed = pack(packer);
            assert_eq!(packed.len() as u64, expected);
            assert_eq!(packed.len() as u64 % BLOCK_SIZE, 0);
        }
    }

    #[test]
    fn test_stream_is_readable_tar() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![3u8; 100_000]).unwrap();
        file.flush().unwrap();

        let mut packer = ArchivePacker::new(&serde_json::json!({"name": "run-1"})).unwrap();
        packer.add_bytes("notes.txt", "hello").unwrap();
        packer.add_file_as("reads.fastq", file.path()).unwrap();
        assert_eq!(packer.entry_count(), 3);

        let packed = pack(packer);
        let mut archive = tar::Archive::new(&packed[..]);
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            seen.push((name, body));
        }

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, METADATA_ENTRY);
        let metadata: serde_json::Value = serde_json::from_slice(&seen[0].1).unwrap();
        assert_eq!(metadata["name"], "run-1");
        assert_eq!(seen[1].0, "files/notes.txt");
        assert_eq!(seen[1].1, b"hello");
        assert_eq!(seen[2].0, "files/reads.fastq");
        assert_eq!(seen[2].1.len(), 100_000);
    }

    #[test]
    fn test_add_file_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let mut packer = ArchivePacker::new(&serde_json::json!({})).unwrap();
        packer.add_file(&path).unwrap();

        let packed = pack(packer);
        let mut archive = tar::Archive::new(&packed[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![METADATA_ENTRY, "files/sample.csv"]);
    }

    #[test]
    fn test_rejects_parent_dir_name() {
        let mut packer = ArchivePacker::new(&serde_json::json!({})).unwrap();
        assert!(packer.add_bytes("../escape", "x").is_err());
    }

    #[test]
    fn test_shrunk_file_fails_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![1u8; 4096]).unwrap();

        let mut packer = ArchivePacker::new(&serde_json::json!({})).unwrap();
        packer.add_file(&path).unwrap();
        std::fs::write(&path, vec![1u8; 10]).unwrap();

        let results: Vec<_> = packer.into_stream().collect();
        assert!(results.last().unwrap().is_err());
    }
}
