//! ridge-core — chunk codec, wire format, and configuration.
//! All other Ridge crates depend on this one.

pub mod chunk;
pub mod chunker;
mod codec;
pub mod config;
pub mod hash;
pub mod wire;

pub use chunk::{is_bare_file_name, Chunk, ChunkError, ChunkKey, IntegrityFault, Metadata, Slice};
pub use hash::{Digest, HashKind};
pub use wire::{Heartbeat, Message, Placement, WireError};
