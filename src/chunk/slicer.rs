//! Random-access blob slicing

use super::{part_count, Chunk, ChunkError, ChunkSource};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

/// A byte source of known size that can be read at any offset
pub trait Blob: Send {
    fn size(&self) -> u64;

    /// Read exactly the bytes in `range`
    fn read_range(&mut self, range: Range<u64>) -> io::Result<Bytes>;
}

impl Blob for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_range(&mut self, range: Range<u64>) -> io::Result<Bytes> {
        if range.end > self.len() as u64 || range.start > range.end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {:?} outside blob of {} bytes", range, self.len()),
            ));
        }
        Ok(self.slice(range.start as usize..range.end as usize))
    }
}

impl<B: Blob + ?Sized> Blob for Box<B> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_range(&mut self, range: Range<u64>) -> io::Result<Bytes> {
        (**self).read_range(range)
    }
}

/// File-backed blob. The size is captured when the file is opened.
#[derive(Debug)]
pub struct FileBlob {
    file: File,
    size: u64,
}

impl FileBlob {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Blob for FileBlob {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, range: Range<u64>) -> io::Result<Bytes> {
        let len = (range.end - range.start) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(range.start))?;
        self.file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Yields `ceil(size / part_size)` chunks by direct slicing
pub struct BlobSlicer<B> {
    blob: B,
    part_size: u64,
    num_parts: u64,
    next_index: u64,
}

impl<B: Blob> BlobSlicer<B> {
    pub fn new(blob: B, part_size: u64) -> Self {
        let num_parts = part_count(blob.size(), part_size);
        Self {
            blob,
            part_size,
            num_parts,
            next_index: 0,
        }
    }

    pub fn num_parts(&self) -> u64 {
        self.num_parts
    }
}

impl<B: Blob> ChunkSource for BlobSlicer<B> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        if self.next_index >= self.num_parts {
            return Ok(None);
        }

        let index = self.next_index;
        let start = index * self.part_size;
        let end = (start + self.part_size).min(self.blob.size());
        let bytes = self.blob.read_range(start..end)?;
        self.next_index += 1;

        Ok(Some(Chunk {
            index: index as usize,
            range: start..end,
            is_last: self.next_index == self.num_parts,
            bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn collect(source: &mut dyn ChunkSource) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_empty_blob_yields_nothing() {
        let mut slicer = BlobSlicer::new(Bytes::new(), 10);
        assert_eq!(slicer.num_parts(), 0);
        assert!(slicer.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_ranges_cover_source_exactly() {
        for total in [1u64, 9, 10, 11, 99, 100, 101] {
            for part_size in [1u64, 3, 10, 100, 1000] {
                let data: Vec<u8> = (0..total).map(|i| i as u8).collect();
                let mut slicer = BlobSlicer::new(Bytes::from(data.clone()), part_size);
                let chunks = collect(&mut slicer);

                assert_eq!(chunks.len() as u64, total.div_ceil(part_size));

                let mut expected_start = 0;
                for (i, chunk) in chunks.iter().enumerate() {
                    assert_eq!(chunk.index, i);
                    assert_eq!(chunk.range.start, expected_start);
                    assert!(chunk.len() <= part_size);
                    assert_eq!(chunk.is_last, i == chunks.len() - 1);
                    expected_start = chunk.range.end;
                }
                assert_eq!(expected_start, total);

                let joined: Vec<u8> = chunks.iter().flat_map(|c| c.bytes.to_vec()).collect();
                assert_eq!(joined, data);
            }
        }
    }

    #[test]
    fn test_file_blob_slices() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello multipart world").unwrap();
        file.flush().unwrap();

        let blob = FileBlob::open(file.path()).unwrap();
        assert_eq!(blob.size(), 21);

        let mut slicer = BlobSlicer::new(blob, 8);
        let chunks = collect(&mut slicer);
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0].bytes[..], b"hello mu");
        assert_eq!(&chunks[2].bytes[..], b"world");
        assert!(chunks[2].is_last);
        assert_eq!(chunks[2].part_number(), 3);
    }

    #[test]
    fn test_bytes_blob_rejects_out_of_range() {
        let mut blob = Bytes::from_static(b"abc");
        assert!(blob.read_range(1..5).is_err());
    }
}
