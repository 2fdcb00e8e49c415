//! Chunk inventory — a storage server's record of the chunks it holds, plus
//! the chunks stored since the last heartbeat went out.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use ridge_core::{ChunkKey, Metadata};

#[derive(Clone, Default)]
pub struct ChunkInventory {
    chunks: Arc<DashMap<ChunkKey, Metadata>>,
    fresh: Arc<Mutex<Vec<Metadata>>>,
}

impl ChunkInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stored chunk. Returns true if the chunk is new or replaces
    /// an older version, in which case it is reported in the next minor
    /// heartbeat.
    pub fn record(&self, metadata: Metadata) -> bool {
        let key = metadata.key();
        let changed = match self.chunks.get(&key) {
            Some(existing) => existing.version != metadata.version,
            None => true,
        };
        if changed {
            self.chunks.insert(key, metadata.clone());
            self.fresh
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(metadata);
        }
        changed
    }

    /// Load chunks found on disk at startup. Nothing is marked fresh: the
    /// first heartbeat after a restart is major and lists everything.
    pub fn restore(&self, chunks: impl IntoIterator<Item = Metadata>) {
        for m in chunks {
            self.chunks.insert(m.key(), m);
        }
    }

    pub fn get(&self, key: &ChunkKey) -> Option<Metadata> {
        self.chunks.get(key).map(|m| m.clone())
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.chunks.contains_key(key)
    }

    /// Every chunk held, for a major heartbeat.
    pub fn all(&self) -> Vec<Metadata> {
        self.chunks.iter().map(|e| e.value().clone()).collect()
    }

    /// Chunks recorded since the previous call, for a minor heartbeat.
    pub fn take_new(&self) -> Vec<Metadata> {
        std::mem::take(&mut *self.fresh.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
