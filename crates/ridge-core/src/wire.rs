//! Ridge wire format: the frame header and every message exchanged between
//! controller, servers, and clients.
//!
//! A connection carries exactly one frame: a fixed 12-byte [`FrameHeader`]
//! followed by `length` bytes of message body. The header is a packed
//! zerocopy struct. Bodies are hand-encoded big-endian records; chunks
//! travel inside them in their own encoding (see [`crate::chunk`]) so the
//! receiver verifies slice digests when it decodes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::chunk::{ChunkKey, Metadata};
use crate::codec::{self, CodecError};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Precedes every message body.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Always [`FRAME_MAGIC`].
    pub magic: [u8; 4],

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// [`MessageKind`] of the body.
    pub kind: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],

    /// Body length in bytes, big-endian.
    pub length: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; 12]);

pub const FRAME_MAGIC: [u8; 4] = *b"RDGE";

/// Current wire format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Header size in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Maximum body length. A chunk of 64 MiB would already be unusual.
pub const MAX_BODY: usize = 64 * 1024 * 1024;

impl FrameHeader {
    pub fn new(kind: MessageKind, body_len: usize) -> Self {
        Self {
            magic: FRAME_MAGIC,
            version: WIRE_VERSION,
            kind: kind.into(),
            reserved: [0; 2],
            length: (body_len as u32).to_be_bytes(),
        }
    }

    /// Parse and validate a header. Returns the message kind and body length.
    pub fn parse(bytes: &[u8]) -> Result<(MessageKind, usize), WireError> {
        let header = FrameHeader::read_from(bytes).ok_or(WireError::Truncated)?;
        if header.magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(header.magic));
        }
        if header.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.reserved != [0; 2] {
            return Err(WireError::ReservedBitsSet);
        }
        let kind = MessageKind::try_from(header.kind)?;
        let length = u32::from_be_bytes(header.length) as usize;
        if length > MAX_BODY {
            return Err(WireError::TooLarge(length));
        }
        Ok((kind, length))
    }
}

// ── Message Kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    CheckIfAlive = 0x01,
    AliveResponse = 0x02,
    MajorHeartbeat = 0x03,
    MinorHeartbeat = 0x04,
    MajorHeartbeatRequest = 0x05,
    WriteRequest = 0x10,
    WriteReply = 0x11,
    WriteData = 0x12,
    ReadRequest = 0x20,
    ReadReply = 0x21,
    ReadDataRequest = 0x22,
    ReadData = 0x23,
    ReadFailed = 0x24,
    RecoveryRequest = 0x30,
    RecoveryReply = 0x31,
    RecoveryDataRequest = 0x32,
    RecoveryData = 0x33,
    TransferRequest = 0x40,
    TransferData = 0x41,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageKind::*;
        Ok(match value {
            0x01 => CheckIfAlive,
            0x02 => AliveResponse,
            0x03 => MajorHeartbeat,
            0x04 => MinorHeartbeat,
            0x05 => MajorHeartbeatRequest,
            0x10 => WriteRequest,
            0x11 => WriteReply,
            0x12 => WriteData,
            0x20 => ReadRequest,
            0x21 => ReadReply,
            0x22 => ReadDataRequest,
            0x23 => ReadData,
            0x24 => ReadFailed,
            0x30 => RecoveryRequest,
            0x31 => RecoveryReply,
            0x32 => RecoveryDataRequest,
            0x33 => RecoveryData,
            0x40 => TransferRequest,
            0x41 => TransferData,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

impl From<MessageKind> for u8 {
    fn from(k: MessageKind) -> u8 {
        k as u8
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Storage node status report.
///
/// A major heartbeat lists every stored chunk; a minor one lists only the
/// chunks stored since the previous heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Address the node accepts connections on.
    pub listening_addr: SocketAddr,
    pub free_space: u64,
    pub total_chunks: u64,
    pub chunks: Vec<Metadata>,
}

/// Controller's answer to a write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Nodes the chunk should be written to.
    Targets(Vec<SocketAddr>),
    /// Not enough live nodes to reach the replication factor.
    InsufficientNodes { needed: u32, available: u32 },
}

/// Every message in the protocol.
///
/// Requests that expect an answer carry the `port` the requester listens
/// on; the reply goes to the requester's IP at that port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Controller → server liveness probe.
    CheckIfAlive,
    AliveResponse { listening_addr: SocketAddr },
    MajorHeartbeat(Heartbeat),
    MinorHeartbeat(Heartbeat),
    /// Controller → server: send a major heartbeat now.
    MajorHeartbeatRequest,

    WriteRequest { key: ChunkKey, port: u16 },
    WriteReply { key: ChunkKey, placement: Placement },
    /// Encoded chunk plus the rest of the replication pipeline.
    WriteData { chunk: Bytes, forward: Vec<SocketAddr> },

    ReadRequest { key: ChunkKey, port: u16 },
    ReadReply { key: ChunkKey, replica: Option<SocketAddr> },
    ReadDataRequest { key: ChunkKey, port: u16 },
    ReadData { key: ChunkKey, chunk: Bytes },
    ReadFailed { key: ChunkKey, reason: String },

    RecoveryRequest { key: ChunkKey, port: u16 },
    RecoveryReply { key: ChunkKey, replicas: Vec<SocketAddr> },
    RecoveryDataRequest { key: ChunkKey, failed: Vec<u32>, port: u16 },
    /// Requested slices by index, from the replica listening at `replica`.
    /// Empty when the replica cannot supply them.
    RecoveryData {
        key: ChunkKey,
        replica: SocketAddr,
        slices: Vec<(u32, Bytes)>,
    },

    /// Controller → holder: copy `key` to `destination`.
    TransferRequest { key: ChunkKey, destination: SocketAddr },
    TransferData { chunk: Bytes },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::CheckIfAlive => MessageKind::CheckIfAlive,
            Message::AliveResponse { .. } => MessageKind::AliveResponse,
            Message::MajorHeartbeat(_) => MessageKind::MajorHeartbeat,
            Message::MinorHeartbeat(_) => MessageKind::MinorHeartbeat,
            Message::MajorHeartbeatRequest => MessageKind::MajorHeartbeatRequest,
            Message::WriteRequest { .. } => MessageKind::WriteRequest,
            Message::WriteReply { .. } => MessageKind::WriteReply,
            Message::WriteData { .. } => MessageKind::WriteData,
            Message::ReadRequest { .. } => MessageKind::ReadRequest,
            Message::ReadReply { .. } => MessageKind::ReadReply,
            Message::ReadDataRequest { .. } => MessageKind::ReadDataRequest,
            Message::ReadData { .. } => MessageKind::ReadData,
            Message::ReadFailed { .. } => MessageKind::ReadFailed,
            Message::RecoveryRequest { .. } => MessageKind::RecoveryRequest,
            Message::RecoveryReply { .. } => MessageKind::RecoveryReply,
            Message::RecoveryDataRequest { .. } => MessageKind::RecoveryDataRequest,
            Message::RecoveryData { .. } => MessageKind::RecoveryData,
            Message::TransferRequest { .. } => MessageKind::TransferRequest,
            Message::TransferData { .. } => MessageKind::TransferData,
        }
    }

    /// Encode as a complete frame: header followed by body.
    pub fn to_frame(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        let header = FrameHeader::new(self.kind(), body.len());
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_slice(header.as_bytes());
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Decode a complete frame produced by [`Message::to_frame`].
    pub fn from_frame(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let (kind, len) = FrameHeader::parse(&frame[..HEADER_LEN])?;
        let body = &frame[HEADER_LEN..];
        if body.len() < len {
            return Err(WireError::Truncated);
        }
        if body.len() > len {
            return Err(WireError::TrailingBytes(body.len() - len));
        }
        Self::decode_body(kind, body)
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::CheckIfAlive | Message::MajorHeartbeatRequest => {}
            Message::AliveResponse { listening_addr } => put_addr(buf, listening_addr),
            Message::MajorHeartbeat(hb) | Message::MinorHeartbeat(hb) => {
                put_addr(buf, &hb.listening_addr);
                buf.put_u64(hb.free_space);
                buf.put_u64(hb.total_chunks);
                buf.put_u32(hb.chunks.len() as u32);
                for m in &hb.chunks {
                    m.encode_into(buf);
                }
            }
            Message::WriteRequest { key, port }
            | Message::ReadRequest { key, port }
            | Message::ReadDataRequest { key, port }
            | Message::RecoveryRequest { key, port } => {
                put_key(buf, key);
                buf.put_u16(*port);
            }
            Message::WriteReply { key, placement } => {
                put_key(buf, key);
                match placement {
                    Placement::Targets(addrs) => {
                        buf.put_u8(0);
                        put_addrs(buf, addrs);
                    }
                    Placement::InsufficientNodes { needed, available } => {
                        buf.put_u8(1);
                        buf.put_u32(*needed);
                        buf.put_u32(*available);
                    }
                }
            }
            Message::WriteData { chunk, forward } => {
                put_addrs(buf, forward);
                put_blob(buf, chunk);
            }
            Message::ReadReply { key, replica } => {
                put_key(buf, key);
                match replica {
                    Some(addr) => {
                        buf.put_u8(1);
                        put_addr(buf, addr);
                    }
                    None => buf.put_u8(0),
                }
            }
            Message::ReadData { key, chunk } => {
                put_key(buf, key);
                put_blob(buf, chunk);
            }
            Message::ReadFailed { key, reason } => {
                put_key(buf, key);
                codec::put_str(buf, reason);
            }
            Message::RecoveryReply { key, replicas } => {
                put_key(buf, key);
                put_addrs(buf, replicas);
            }
            Message::RecoveryDataRequest { key, failed, port } => {
                put_key(buf, key);
                buf.put_u32(failed.len() as u32);
                for i in failed {
                    buf.put_u32(*i);
                }
                buf.put_u16(*port);
            }
            Message::RecoveryData { key, replica, slices } => {
                put_key(buf, key);
                put_addr(buf, replica);
                buf.put_u32(slices.len() as u32);
                for (i, data) in slices {
                    buf.put_u32(*i);
                    put_blob(buf, data);
                }
            }
            Message::TransferRequest { key, destination } => {
                put_key(buf, key);
                put_addr(buf, destination);
            }
            Message::TransferData { chunk } => put_blob(buf, chunk),
        }
    }

    fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Self, WireError> {
        let mut buf = body;
        let b = &mut buf;
        let msg = match kind {
            MessageKind::CheckIfAlive => Message::CheckIfAlive,
            MessageKind::MajorHeartbeatRequest => Message::MajorHeartbeatRequest,
            MessageKind::AliveResponse => Message::AliveResponse {
                listening_addr: get_addr(b)?,
            },
            MessageKind::MajorHeartbeat => Message::MajorHeartbeat(get_heartbeat(b)?),
            MessageKind::MinorHeartbeat => Message::MinorHeartbeat(get_heartbeat(b)?),
            MessageKind::WriteRequest => Message::WriteRequest {
                key: get_key(b)?,
                port: codec::get_u16(b)?,
            },
            MessageKind::ReadRequest => Message::ReadRequest {
                key: get_key(b)?,
                port: codec::get_u16(b)?,
            },
            MessageKind::ReadDataRequest => Message::ReadDataRequest {
                key: get_key(b)?,
                port: codec::get_u16(b)?,
            },
            MessageKind::RecoveryRequest => Message::RecoveryRequest {
                key: get_key(b)?,
                port: codec::get_u16(b)?,
            },
            MessageKind::WriteReply => {
                let key = get_key(b)?;
                let placement = match codec::get_u8(b)? {
                    0 => Placement::Targets(get_addrs(b)?),
                    1 => Placement::InsufficientNodes {
                        needed: codec::get_u32(b)?,
                        available: codec::get_u32(b)?,
                    },
                    other => return Err(WireError::BadTag(other)),
                };
                Message::WriteReply { key, placement }
            }
            MessageKind::WriteData => Message::WriteData {
                forward: get_addrs(b)?,
                chunk: get_blob(b)?,
            },
            MessageKind::ReadReply => {
                let key = get_key(b)?;
                let replica = match codec::get_u8(b)? {
                    0 => None,
                    1 => Some(get_addr(b)?),
                    other => return Err(WireError::BadTag(other)),
                };
                Message::ReadReply { key, replica }
            }
            MessageKind::ReadData => Message::ReadData {
                key: get_key(b)?,
                chunk: get_blob(b)?,
            },
            MessageKind::ReadFailed => Message::ReadFailed {
                key: get_key(b)?,
                reason: codec::get_str(b)?,
            },
            MessageKind::RecoveryReply => Message::RecoveryReply {
                key: get_key(b)?,
                replicas: get_addrs(b)?,
            },
            MessageKind::RecoveryDataRequest => {
                let key = get_key(b)?;
                let n = get_count(b, 4)?;
                let mut failed = Vec::with_capacity(n);
                for _ in 0..n {
                    failed.push(codec::get_u32(b)?);
                }
                Message::RecoveryDataRequest {
                    key,
                    failed,
                    port: codec::get_u16(b)?,
                }
            }
            MessageKind::RecoveryData => {
                let key = get_key(b)?;
                let replica = get_addr(b)?;
                let n = get_count(b, 8)?;
                let mut slices = Vec::with_capacity(n);
                for _ in 0..n {
                    let index = codec::get_u32(b)?;
                    slices.push((index, get_blob(b)?));
                }
                Message::RecoveryData { key, replica, slices }
            }
            MessageKind::TransferRequest => Message::TransferRequest {
                key: get_key(b)?,
                destination: get_addr(b)?,
            },
            MessageKind::TransferData => Message::TransferData {
                chunk: get_blob(b)?,
            },
        };
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes(buf.len()));
        }
        Ok(msg)
    }
}

// ── Field codecs ──────────────────────────────────────────────────────────────

fn put_key(buf: &mut BytesMut, key: &ChunkKey) {
    codec::put_str(buf, &key.filename);
    buf.put_u64(key.sequence);
}

fn get_key(buf: &mut &[u8]) -> Result<ChunkKey, WireError> {
    Ok(ChunkKey {
        filename: codec::get_file_name(buf)?,
        sequence: codec::get_u64(buf)?,
    })
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn get_addr(buf: &mut &[u8]) -> Result<SocketAddr, WireError> {
    let ip = match codec::get_u8(buf)? {
        4 => {
            let raw: [u8; 4] = codec::get_bytes(buf, 4)?
                .try_into()
                .map_err(|_| WireError::Truncated)?;
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        6 => {
            let raw: [u8; 16] = codec::get_bytes(buf, 16)?
                .try_into()
                .map_err(|_| WireError::Truncated)?;
            IpAddr::V6(Ipv6Addr::from(raw))
        }
        other => return Err(WireError::BadAddressFamily(other)),
    };
    Ok(SocketAddr::new(ip, codec::get_u16(buf)?))
}

fn put_addrs(buf: &mut BytesMut, addrs: &[SocketAddr]) {
    buf.put_u32(addrs.len() as u32);
    for a in addrs {
        put_addr(buf, a);
    }
}

fn get_addrs(buf: &mut &[u8]) -> Result<Vec<SocketAddr>, WireError> {
    let n = get_count(buf, 7)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(get_addr(buf)?);
    }
    Ok(out)
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_blob(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    let len = codec::get_u32(buf)? as usize;
    Ok(Bytes::copy_from_slice(codec::get_bytes(buf, len)?))
}

/// Read a u32 element count and reject counts the remaining bytes cannot
/// possibly hold, given each element's minimum encoded size.
fn get_count(buf: &mut &[u8], min_elem: usize) -> Result<usize, WireError> {
    let n = codec::get_u32(buf)? as usize;
    if n > buf.len() / min_elem {
        return Err(WireError::Truncated);
    }
    Ok(n)
}

fn get_heartbeat(buf: &mut &[u8]) -> Result<Heartbeat, WireError> {
    let listening_addr = get_addr(buf)?;
    let free_space = codec::get_u64(buf)?;
    let total_chunks = codec::get_u64(buf)?;
    // filename length + sequence + version + timestamp
    let n = get_count(buf, 2 + 8 + 4 + 8)?;
    let mut chunks = Vec::with_capacity(n);
    for _ in 0..n {
        chunks.push(Metadata::decode_from(buf)?);
    }
    Ok(Heartbeat {
        listening_addr,
        free_space,
        total_chunks,
        chunks,
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("reserved header bytes are non-zero")]
    ReservedBitsSet,

    #[error("body length {0} exceeds maximum {}", MAX_BODY)]
    TooLarge(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("chunk file name is not a bare file name")]
    BadFileName,

    #[error("unknown address family: {0}")]
    BadAddressFamily(u8),

    #[error("unknown variant tag: {0}")]
    BadTag(u8),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

impl From<CodecError> for WireError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Truncated => WireError::Truncated,
            CodecError::InvalidUtf8 => WireError::InvalidUtf8,
            CodecError::BadFileName => WireError::BadFileName,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
