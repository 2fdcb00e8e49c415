//! Chunks, slices, and the chunk binary encoding.
//!
//! A chunk is an ordered, non-empty run of equal-size slices plus the
//! metadata naming it. On the wire and on disk every slice is preceded by
//! its digest so the receiver can verify each slice independently:
//!
//! ```text
//! is_last      u8
//! filename     u16 length + UTF-8
//! sequence     u64
//! version      u32
//! timestamp    u64   (ms since the Unix epoch)
//! slice_count  u32
//! digests      slice_count × (u16 length + bytes)
//! slice_size   u32
//! payloads     slices back to back; only the final one may be short
//! ```
//!
//! All integers are big-endian. Decoding never stops at the first bad
//! slice: every slice is checked and all failures are reported together in
//! an [`IntegrityFault`], which keeps the chunk as received so only the
//! broken slices need to be fetched again.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{self, CodecError};
use crate::hash::{Digest, HashKind};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("chunk size {chunk_size} is not a multiple of slice size {slice_size}")]
    SizeMismatch { chunk_size: usize, slice_size: usize },

    #[error("slice index {index} out of range for chunk of {count} slices")]
    SliceIndexOutOfRange { index: usize, count: usize },

    #[error("malformed chunk encoding: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Integrity(Box<IntegrityFault>),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for ChunkError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Truncated => ChunkError::Malformed("truncated"),
            CodecError::InvalidUtf8 => ChunkError::Malformed("filename is not UTF-8"),
            CodecError::BadFileName => ChunkError::Malformed("filename is not a bare file name"),
        }
    }
}

// ── Key & Metadata ────────────────────────────────────────────────────────────

/// True if `name` can name a chunk: non-empty, not `.` or `..`, free of `/`
/// and NUL, and short enough for its u16 length prefix. Chunk files are
/// stored under this name, so anything else could escape the store.
pub fn is_bare_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\0'])
        && name.len() <= u16::MAX as usize
}

/// Globally unique chunk identity: file name plus sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub filename: String,
    pub sequence: u64,
}

impl ChunkKey {
    pub fn new(filename: impl Into<String>, sequence: u64) -> Self {
        Self {
            filename: filename.into(),
            sequence,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.filename, self.sequence)
    }
}

/// Identity of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub filename: String,
    pub sequence: u64,
    /// Incremented each time the chunk is overwritten.
    pub version: u32,
    /// Milliseconds since the Unix epoch. Informational only.
    pub timestamp: u64,
}

impl Metadata {
    /// Fresh metadata at version 0, stamped with the current time.
    ///
    /// `filename` must pass [`is_bare_file_name`].
    pub fn new(filename: impl Into<String>, sequence: u64) -> Result<Self, ChunkError> {
        let filename = filename.into();
        if !is_bare_file_name(&filename) {
            return Err(ChunkError::InvalidArgument(format!(
                "not a bare file name: {filename:?}"
            )));
        }
        Ok(Self {
            filename,
            sequence,
            version: 0,
            timestamp: now_millis(),
        })
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.filename.clone(), self.sequence)
    }

    /// Record an overwrite: bump the version and refresh the timestamp.
    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
        self.timestamp = now_millis();
    }

    pub(crate) fn encode_into(&self, buf: &mut impl BufMut) {
        codec::put_str(buf, &self.filename);
        buf.put_u64(self.sequence);
        buf.put_u32(self.version);
        buf.put_u64(self.timestamp);
    }

    pub(crate) fn decode_from(buf: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            filename: codec::get_file_name(buf)?,
            sequence: codec::get_u64(buf)?,
            version: codec::get_u32(buf)?,
            timestamp: codec::get_u64(buf)?,
        })
    }

    /// Read only the metadata at the front of an encoded chunk, without
    /// touching the payload. Used to index stored chunks at startup.
    pub fn peek(encoded: &[u8]) -> Result<Self, ChunkError> {
        let mut buf = encoded;
        codec::get_u8(&mut buf)?;
        Ok(Self::decode_from(&mut buf)?)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ── Slice ─────────────────────────────────────────────────────────────────────

/// An immutable run of at most `slice_size` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice(Bytes);

impl Slice {
    /// Copy `data` into a new slice. Fails if `data` is empty or longer
    /// than `slice_size`.
    pub fn new(data: &[u8], slice_size: usize) -> Result<Self, ChunkError> {
        if data.is_empty() {
            return Err(ChunkError::InvalidArgument("empty slice".into()));
        }
        if data.len() > slice_size {
            return Err(ChunkError::InvalidArgument(format!(
                "slice of {} bytes exceeds slice size {slice_size}",
                data.len()
            )));
        }
        Ok(Self(Bytes::copy_from_slice(data)))
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn digest(&self, kind: HashKind) -> Digest {
        kind.digest(&self.0)
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    metadata: Metadata,
    slices: Vec<Slice>,
    slice_size: usize,
    is_last: bool,
    hash: HashKind,
}

impl Chunk {
    /// Assemble a chunk. Every slice except the final one must be exactly
    /// `slice_size` bytes.
    pub fn new(
        metadata: Metadata,
        slices: Vec<Slice>,
        slice_size: usize,
        is_last: bool,
        hash: HashKind,
    ) -> Result<Self, ChunkError> {
        if slice_size == 0 || slice_size > u32::MAX as usize {
            return Err(ChunkError::InvalidArgument(format!(
                "slice size {slice_size} out of range"
            )));
        }
        let Some((last, full)) = slices.split_last() else {
            return Err(ChunkError::InvalidArgument("chunk has no slices".into()));
        };
        if full.iter().any(|s| s.len() != slice_size) || last.len() > slice_size {
            return Err(ChunkError::InvalidArgument(
                "only the final slice of a chunk may be short".into(),
            ));
        }
        Ok(Self {
            metadata,
            slices,
            slice_size,
            is_last,
            hash,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn key(&self) -> ChunkKey {
        self.metadata.key()
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn slice(&self, index: usize) -> Option<&Slice> {
        self.slices.get(index)
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash
    }

    /// Payload bytes of all slices, concatenated.
    pub fn data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_len());
        for s in &self.slices {
            out.extend_from_slice(s.data());
        }
        out
    }

    pub fn data_len(&self) -> usize {
        self.slices.iter().map(Slice::len).sum()
    }

    /// Replace slice `index` in place.
    pub fn fix_slice(&mut self, index: usize, slice: Slice) -> Result<(), ChunkError> {
        let count = self.slices.len();
        if index >= count {
            return Err(ChunkError::SliceIndexOutOfRange { index, count });
        }
        let is_final = index == count - 1;
        if slice.len() > self.slice_size || (!is_final && slice.len() != self.slice_size) {
            return Err(ChunkError::InvalidArgument(format!(
                "replacement slice {index} has {} bytes, slice size is {}",
                slice.len(),
                self.slice_size
            )));
        }
        self.slices[index] = slice;
        Ok(())
    }

    // ── Encoding ──────────────────────────────────────────────────────────

    pub fn encode(&self) -> Bytes {
        let digest_len = self.hash.digest_len();
        let mut buf = BytesMut::with_capacity(
            32 + self.metadata.filename.len()
                + self.slices.len() * (2 + digest_len)
                + self.data_len(),
        );
        buf.put_u8(self.is_last as u8);
        self.metadata.encode_into(&mut buf);
        buf.put_u32(self.slices.len() as u32);
        for s in &self.slices {
            let d = s.digest(self.hash);
            buf.put_u16(d.as_bytes().len() as u16);
            buf.put_slice(d.as_bytes());
        }
        buf.put_u32(self.slice_size as u32);
        for s in &self.slices {
            buf.put_slice(s.data());
        }
        buf.freeze()
    }

    /// Decode and verify an encoded chunk.
    ///
    /// Structural problems are [`ChunkError::Malformed`]. Digest mismatches
    /// are collected across all slices and returned once as
    /// [`ChunkError::Integrity`].
    pub fn decode(encoded: &[u8]) -> Result<Self, ChunkError> {
        let mut buf = encoded;

        let is_last = match codec::get_u8(&mut buf)? {
            0 => false,
            1 => true,
            _ => return Err(ChunkError::Malformed("is_last flag is not 0 or 1")),
        };
        let metadata = Metadata::decode_from(&mut buf)?;

        let count = codec::get_u32(&mut buf)? as usize;
        if count == 0 {
            return Err(ChunkError::Malformed("zero slices"));
        }
        // Each digest costs at least its 2-byte length prefix.
        if count > buf.len() / 2 {
            return Err(ChunkError::Malformed("slice count exceeds encoding"));
        }

        let mut expected = Vec::with_capacity(count);
        let mut kind = None;
        for _ in 0..count {
            let len = codec::get_u16(&mut buf)? as usize;
            let this = HashKind::from_len(len).ok_or(ChunkError::Malformed("unknown digest length"))?;
            if kind.is_some_and(|k| k != this) {
                return Err(ChunkError::Malformed("mixed digest algorithms"));
            }
            kind = Some(this);
            expected.push(Digest::from_bytes(codec::get_bytes(&mut buf, len)?));
        }
        let hash = kind.unwrap_or_default();

        let slice_size = codec::get_u32(&mut buf)? as usize;
        if slice_size == 0 {
            return Err(ChunkError::Malformed("zero slice size"));
        }

        let full = (count - 1)
            .checked_mul(slice_size)
            .ok_or(ChunkError::Malformed("slice layout overflows"))?;
        if buf.len() <= full || buf.len() - full > slice_size {
            return Err(ChunkError::Malformed("payload length does not match slice layout"));
        }

        let mut slices = Vec::with_capacity(count);
        let mut failed = Vec::new();
        for (i, digest) in expected.iter().enumerate() {
            let len = if i + 1 == count { buf.len() } else { slice_size };
            let slice = Slice::new(codec::get_bytes(&mut buf, len)?, slice_size)?;
            if slice.digest(hash) != *digest {
                failed.push(i);
            }
            slices.push(slice);
        }

        let chunk = Chunk {
            metadata,
            slices,
            slice_size,
            is_last,
            hash,
        };

        if failed.is_empty() {
            Ok(chunk)
        } else {
            Err(ChunkError::Integrity(Box::new(IntegrityFault {
                failed,
                chunk,
                expected,
            })))
        }
    }
}

// ── Integrity fault ───────────────────────────────────────────────────────────

/// One or more slices failed verification while decoding.
///
/// Holds the chunk as received (bad slices included) and the digests the
/// sender declared, so recovered slices can be checked against them.
#[derive(Debug, Clone)]
pub struct IntegrityFault {
    failed: Vec<usize>,
    chunk: Chunk,
    expected: Vec<Digest>,
}

impl IntegrityFault {
    /// Indices of the slices that failed verification, ascending.
    pub fn failed(&self) -> &[usize] {
        &self.failed
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn into_chunk(self) -> Chunk {
        self.chunk
    }

    pub fn key(&self) -> ChunkKey {
        self.chunk.key()
    }

    /// Patch the chunk with recovered slices and re-verify only the patched
    /// indices against the declared digests.
    ///
    /// Returns the repaired chunk when every failed slice has been replaced
    /// by a verifying one. Otherwise returns a fault listing the slices that
    /// are still bad.
    pub fn repair(mut self, recovered: Vec<(usize, Slice)>) -> Result<Chunk, ChunkError> {
        for (index, slice) in recovered {
            self.chunk.fix_slice(index, slice)?;
            let ok = self
                .chunk
                .slice(index)
                .map(|s| s.digest(self.chunk.hash) == self.expected[index])
                .unwrap_or(false);
            if ok {
                self.failed.retain(|&i| i != index);
            } else if !self.failed.contains(&index) {
                self.failed.push(index);
                self.failed.sort_unstable();
            }
        }

        if self.failed.is_empty() {
            Ok(self.chunk)
        } else {
            Err(ChunkError::Integrity(Box::new(self)))
        }
    }
}

impl fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "integrity check failed for {}: slices {:?}",
            self.chunk.key(),
            self.failed
        )
    }
}

impl std::error::Error for IntegrityFault {}
