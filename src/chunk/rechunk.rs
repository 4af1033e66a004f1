//! Re-buffering of unaligned segment streams into part-sized chunks

use super::{Chunk, ChunkError, ChunkSource};
use bytes::{Bytes, BytesMut};

/// Collects segments of any size into chunks of exactly `part_size` bytes,
/// forwarding a shorter final chunk when the source ends.
///
/// `total_bytes` is the length the source promised; the final chunk is
/// flagged by reaching it, and a source that yields more or fewer bytes is
/// an error.
pub struct Rechunker<S> {
    source: S,
    part_size: u64,
    total_bytes: u64,
    buffer: BytesMut,
    offset: u64,
    index: usize,
    exhausted: bool,
}

impl<S> Rechunker<S>
where
    S: Iterator<Item = Result<Bytes, ChunkError>> + Send,
{
    pub fn new(source: S, part_size: u64, total_bytes: u64) -> Self {
        Self {
            source,
            part_size,
            total_bytes,
            buffer: BytesMut::new(),
            offset: 0,
            index: 0,
            exhausted: false,
        }
    }

    fn emit(&mut self, len: usize) -> Result<Chunk, ChunkError> {
        let bytes = self.buffer.split_to(len).freeze();
        let start = self.offset;
        let end = start + len as u64;
        if end > self.total_bytes {
            return Err(ChunkError::Archive(format!(
                "source produced more than the expected {} bytes",
                self.total_bytes
            )));
        }

        let chunk = Chunk {
            index: self.index,
            range: start..end,
            is_last: end == self.total_bytes,
            bytes,
        };
        self.offset = end;
        self.index += 1;
        Ok(chunk)
    }
}

impl<S> ChunkSource for Rechunker<S>
where
    S: Iterator<Item = Result<Bytes, ChunkError>> + Send,
{
    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        loop {
            if self.buffer.len() as u64 >= self.part_size {
                return self.emit(self.part_size as usize).map(Some);
            }

            if self.exhausted {
                if !self.buffer.is_empty() {
                    return self.emit(self.buffer.len()).map(Some);
                }
                if self.offset != self.total_bytes {
                    return Err(ChunkError::Archive(format!(
                        "source ended after {} of {} expected bytes",
                        self.offset, self.total_bytes
                    )));
                }
                return Ok(None);
            }

            match self.source.next() {
                Some(Ok(segment)) => self.buffer.extend_from_slice(&segment),
                Some(Err(e)) => return Err(e),
                None => self.exhausted = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ArchivePacker;

    fn segments(sizes: &[usize]) -> (Vec<u8>, impl Iterator<Item = Result<Bytes, ChunkError>> + Send) {
        let mut all = Vec::new();
        let mut parts = Vec::new();
        let mut counter = 0u8;
        for size in sizes {
            let piece: Vec<u8> = (0..*size)
                .map(|_| {
                    counter = counter.wrapping_add(1);
                    counter
                })
                .collect();
            all.extend_from_slice(&piece);
            parts.push(Ok(Bytes::from(piece)));
        }
        (all, parts.into_iter())
    }

    fn drain(source: &mut dyn ChunkSource) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_rebuffers_to_part_size() {
        let (data, source) = segments(&[3, 10, 1, 1, 7, 2]);
        let mut rechunker = Rechunker::new(source, 5, data.len() as u64);
        let chunks = drain(&mut rechunker);

        let lens: Vec<u64> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![5, 5, 5, 5, 4]);
        assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
        assert!(chunks.last().unwrap().is_last);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.bytes.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_exact_multiple_has_no_tail() {
        let (data, source) = segments(&[4, 4, 2]);
        let mut rechunker = Rechunker::new(source, 5, data.len() as u64);
        let chunks = drain(&mut rechunker);

        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_last);
        assert!(chunks[1].is_last);
        assert_eq!(chunks[1].range, 5..10);
    }

    #[test]
    fn test_short_source_is_error() {
        let (_, source) = segments(&[4]);
        let mut rechunker = Rechunker::new(source, 5, 8);
        let partial = rechunker.next_chunk().unwrap().unwrap();
        assert_eq!(partial.range, 0..4);
        assert!(!partial.is_last);
        assert!(rechunker.next_chunk().is_err());
    }

    #[test]
    fn test_long_source_is_error() {
        let (_, source) = segments(&[12]);
        let mut rechunker = Rechunker::new(source, 5, 8);
        assert!(rechunker.next_chunk().is_ok());
        assert!(rechunker.next_chunk().is_err());
    }

    #[test]
    fn test_archive_chunks_cover_stream() {
        let mut packer = ArchivePacker::new(&serde_json::json!({"id": 9})).unwrap();
        packer.add_bytes("a.bin", vec![1u8; 3000]).unwrap();
        packer.add_bytes("b.bin", vec![2u8; 777]).unwrap();
        let total = packer.total_bytes();

        let mut rechunker = Rechunker::new(packer.into_stream(), 1024, total);
        let chunks = drain(&mut rechunker);

        assert_eq!(chunks.len() as u64, total.div_ceil(1024));
        assert_eq!(chunks.last().unwrap().range.end, total);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].range.end, pair[1].range.start);
        }
    }
}
