//! Slice hashing.
//!
//! Every slice of a chunk carries a digest on the wire. Two algorithms are
//! supported behind [`HashKind`]: a 2-byte CRC-16 for cheap corruption
//! detection and a 32-byte BLAKE3 digest. The algorithm is not tagged on the
//! wire; a decoder recognises it from the digest length.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hash algorithm used for slice digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    /// CRC-16/XMODEM (polynomial 0x1021, zero initial value).
    Crc16,
    /// BLAKE3, 32-byte output.
    #[default]
    Blake3,
}

impl HashKind {
    /// Digest length in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            HashKind::Crc16 => 2,
            HashKind::Blake3 => 32,
        }
    }

    /// Recognise an algorithm from a digest length seen on the wire.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            2 => Some(HashKind::Crc16),
            32 => Some(HashKind::Blake3),
            _ => None,
        }
    }

    /// Compute the digest of `data`.
    pub fn digest(self, data: &[u8]) -> Digest {
        match self {
            HashKind::Crc16 => Digest(crc16(data).to_be_bytes().to_vec()),
            HashKind::Blake3 => Digest(blake3::hash(data).as_bytes().to_vec()),
        }
    }
}

impl std::str::FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crc16" => Ok(HashKind::Crc16),
            "blake3" => Ok(HashKind::Blake3),
            other => Err(format!("unknown hash algorithm: {other}")),
        }
    }
}

// ── Digest ────────────────────────────────────────────────────────────────────

/// Raw digest bytes. Displayed as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Algorithm that produced this digest, judged by length.
    pub fn kind(&self) -> Option<HashKind> {
        HashKind::from_len(self.0.len())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0))
    }
}

// ── CRC-16 ────────────────────────────────────────────────────────────────────

const CRC16_POLY: u16 = 0x1021;

/// Bitwise CRC-16/XMODEM.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}
