//! Splitting byte streams into chunks and joining them back.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use crate::chunk::{Chunk, ChunkError, Metadata, Slice};
use crate::hash::HashKind;

/// Lazy, forward-only chunk sequence over a reader.
///
/// Every chunk but the last holds `chunk_size / slice_size` full slices.
/// The last holds whatever remains and is flagged `is_last`. An empty
/// input yields no chunks at all.
pub struct Chunker<R> {
    reader: BufReader<R>,
    filename: String,
    chunk_size: usize,
    slice_size: usize,
    hash: HashKind,
    sequence: u64,
    done: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(
        reader: R,
        filename: impl Into<String>,
        chunk_size: usize,
        slice_size: usize,
        hash: HashKind,
    ) -> Result<Self, ChunkError> {
        check_sizes(chunk_size, slice_size)?;
        Ok(Self {
            reader: BufReader::new(reader),
            filename: filename.into(),
            chunk_size,
            slice_size,
            hash,
            sequence: 0,
            done: false,
        })
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        let mut buf = Vec::with_capacity(self.chunk_size);
        (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(None);
        }

        let is_last = self.reader.fill_buf()?.is_empty();
        let slices = buf
            .chunks(self.slice_size)
            .map(|s| Slice::new(s, self.slice_size))
            .collect::<Result<Vec<_>, _>>()?;
        let metadata = Metadata::new(self.filename.clone(), self.sequence)?;
        let chunk = Chunk::new(metadata, slices, self.slice_size, is_last, self.hash)?;

        self.sequence += 1;
        if is_last {
            self.done = true;
        }
        Ok(Some(chunk))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Chunk a file on disk. Chunks are named after the file's base name.
pub fn chunk_file(
    path: &Path,
    chunk_size: usize,
    slice_size: usize,
    hash: HashKind,
) -> Result<Chunker<File>, ChunkError> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ChunkError::InvalidArgument(format!("no file name in {}", path.display())))?
        .to_string();
    check_sizes(chunk_size, slice_size)?;
    let file = File::open(path)?;
    Chunker::new(file, filename, chunk_size, slice_size, hash)
}

/// Write the payloads of `chunks` to `out` in order.
///
/// Chunks must arrive with consecutive sequence numbers starting at 0 and
/// the final one must carry `is_last`. Returns the number of bytes written.
pub fn combine<I, W>(chunks: I, out: &mut W) -> Result<u64, ChunkError>
where
    I: IntoIterator<Item = Chunk>,
    W: Write,
{
    let mut expected = 0u64;
    let mut finished = false;
    let mut written = 0u64;

    for chunk in chunks {
        if finished {
            return Err(ChunkError::InvalidArgument(
                "chunk follows the final chunk".into(),
            ));
        }
        let seq = chunk.metadata().sequence;
        if seq != expected {
            return Err(ChunkError::InvalidArgument(format!(
                "expected chunk {expected}, got {seq}"
            )));
        }
        for slice in chunk.slices() {
            out.write_all(slice.data())?;
            written += slice.len() as u64;
        }
        finished = chunk.is_last();
        expected += 1;
    }

    if expected > 0 && !finished {
        return Err(ChunkError::InvalidArgument("final chunk is missing".into()));
    }
    out.flush()?;
    Ok(written)
}

fn check_sizes(chunk_size: usize, slice_size: usize) -> Result<(), ChunkError> {
    if slice_size == 0 || chunk_size == 0 || chunk_size % slice_size != 0 {
        return Err(ChunkError::SizeMismatch {
            chunk_size,
            slice_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn chunk_all(data: &[u8], chunk_size: usize, slice_size: usize) -> Vec<Chunk> {
        Chunker::new(data, "data.bin", chunk_size, slice_size, HashKind::Crc16)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn seventy_kib_makes_two_chunks() {
        let data = pattern(70 * KIB);
        let chunks = chunk_all(&data, 64 * KIB, 8 * KIB);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].slice_count(), 8);
        assert!(!chunks[0].is_last());
        assert_eq!(chunks[1].slice_count(), 1);
        assert_eq!(chunks[1].slice(0).unwrap().len(), 6 * KIB);
        assert!(chunks[1].is_last());
        assert_eq!(chunks[0].metadata().sequence, 0);
        assert_eq!(chunks[1].metadata().sequence, 1);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let data = pattern(128);
        let chunks = chunk_all(&data, 64, 16);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_last());
        assert_eq!(chunks[1].slice_count(), 4);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(chunk_all(&[], 64, 16).is_empty());
    }

    #[test]
    fn mismatched_sizes_rejected() {
        let err = Chunker::new(&[][..], "x", 100, 16, HashKind::Crc16).err();
        assert!(matches!(err, Some(ChunkError::SizeMismatch { .. })));
        assert!(Chunker::new(&[][..], "x", 64, 0, HashKind::Crc16).is_err());
    }

    #[test]
    fn chunk_then_combine_round_trips() {
        for (len, chunk_size, slice_size) in [(1, 8, 4), (1000, 64, 8), (4096, 512, 512), (70 * KIB, 64 * KIB, 8 * KIB)] {
            let data = pattern(len);
            let chunks = chunk_all(&data, chunk_size, slice_size);
            let mut out = Vec::new();
            let n = combine(chunks, &mut out).unwrap();
            assert_eq!(n as usize, len);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn combine_rejects_gaps_and_missing_tail() {
        let chunks = chunk_all(&pattern(300), 64, 16);
        let mut gapped = chunks.clone();
        gapped.remove(1);
        assert!(combine(gapped, &mut Vec::new()).is_err());

        let mut headless = chunks;
        headless.pop();
        assert!(combine(headless, &mut Vec::new()).is_err());
    }

    #[test]
    fn chunk_file_uses_base_name() {
        let path = std::env::temp_dir().join(format!("ridge-chunker-{}.bin", std::process::id()));
        std::fs::write(&path, pattern(100)).unwrap();

        let chunks: Vec<_> = chunk_file(&path, 64, 16, HashKind::Blake3)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let expected = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.metadata().filename == expected));

        let _ = std::fs::remove_file(&path);
    }
}
