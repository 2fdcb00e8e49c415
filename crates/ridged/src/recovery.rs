//! Read-path repair of corrupted chunks.
//!
//! A server that finds a stored chunk failing verification while serving a
//! read asks the controller where the other replicas live, then asks those
//! replicas one at a time for the failed slices. Patched slices are checked
//! against the digests stored with the chunk, so a replica holding a bad
//! copy of the same slice cannot poison the repair.
//!
//! [`Recoveries`] holds one entry per chunk under repair and only decides
//! what happens next; the server performs the I/O each [`Step`] names.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use ridge_core::{Chunk, ChunkError, ChunkKey, IntegrityFault, Slice};

/// How long one recovery request may go unanswered before moving on.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// What the server should do next for a chunk under repair.
#[derive(Debug)]
pub enum Step {
    /// Ask the controller for the chunk's other replicas.
    LocateReplicas,
    /// Ask `replica` for the listed slices.
    RequestSlices { replica: SocketAddr, failed: Vec<u32> },
    /// Every failed slice was replaced. Persist and answer the readers.
    Repaired { chunk: Chunk, readers: Vec<SocketAddr> },
    /// No replica could supply the slices.
    Abandoned { failed: Vec<usize>, readers: Vec<SocketAddr> },
    /// An answer is outstanding.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Locating,
    Awaiting(SocketAddr),
}

#[derive(Debug)]
struct Pending {
    fault: IntegrityFault,
    readers: Vec<SocketAddr>,
    replicas: VecDeque<SocketAddr>,
    stage: Stage,
    since: Instant,
}

/// Chunks currently being repaired, keyed by chunk.
#[derive(Debug)]
pub struct Recoveries {
    local: SocketAddr,
    pending: HashMap<ChunkKey, Pending>,
}

impl Recoveries {
    /// `local` is this server's advertised address; it is never asked for
    /// its own slices.
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_active(&self, key: &ChunkKey) -> bool {
        self.pending.contains_key(key)
    }

    /// A read hit a corrupted chunk. Starts a repair, or joins `reader` to
    /// the one already running for the same chunk.
    pub fn begin(&mut self, fault: IntegrityFault, reader: SocketAddr) -> Step {
        let key = fault.key();
        if let Some(p) = self.pending.get_mut(&key) {
            if !p.readers.contains(&reader) {
                p.readers.push(reader);
            }
            return Step::Wait;
        }
        self.pending.insert(
            key,
            Pending {
                fault,
                readers: vec![reader],
                replicas: VecDeque::new(),
                stage: Stage::Locating,
                since: Instant::now(),
            },
        );
        Step::LocateReplicas
    }

    /// The controller answered with the chunk's replicas.
    pub fn on_replicas(&mut self, key: &ChunkKey, replicas: Vec<SocketAddr>) -> Step {
        let local = self.local;
        let Some(p) = self.pending.get_mut(key) else {
            return Step::Wait;
        };
        if p.stage != Stage::Locating {
            return Step::Wait;
        }
        p.replicas = replicas.into_iter().filter(|a| *a != local).collect();
        self.advance(key)
    }

    /// `replica` answered with slices. An empty list means it could not
    /// help. Only the replica currently being asked is heard; a late answer
    /// from one that already timed out is dropped.
    pub fn on_slices(
        &mut self,
        key: &ChunkKey,
        replica: SocketAddr,
        slices: Vec<(u32, Bytes)>,
    ) -> Step {
        let Some(p) = self.pending.get_mut(key) else {
            return Step::Wait;
        };
        if p.stage != Stage::Awaiting(replica) {
            tracing::debug!(chunk = %key, %replica, "ignoring answer from a replica not being asked");
            return Step::Wait;
        }
        if slices.is_empty() {
            return self.advance(key);
        }

        let slice_size = p.fault.chunk().slice_size();
        let recovered: Result<Vec<(usize, Slice)>, ChunkError> = slices
            .into_iter()
            .map(|(i, data)| Ok((i as usize, Slice::new(&data, slice_size)?)))
            .collect();
        let recovered = match recovered {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(chunk = %key, error = %e, "replica sent unusable slices");
                return self.advance(key);
            }
        };

        match p.fault.clone().repair(recovered) {
            Ok(chunk) => match self.pending.remove(key) {
                Some(done) => Step::Repaired {
                    chunk,
                    readers: done.readers,
                },
                None => Step::Wait,
            },
            Err(ChunkError::Integrity(narrower)) => {
                tracing::debug!(chunk = %key, still_failed = ?narrower.failed(), "partial repair");
                p.fault = *narrower;
                self.advance(key)
            }
            Err(e) => {
                tracing::warn!(chunk = %key, error = %e, "replica slices did not fit the chunk");
                self.advance(key)
            }
        }
    }

    /// The last request for `key` could not be delivered, or was never
    /// answered.
    pub fn on_unreachable(&mut self, key: &ChunkKey) -> Step {
        match self.pending.get(key).map(|p| p.stage) {
            Some(Stage::Locating) => self.abandon(key),
            Some(Stage::Awaiting(_)) => self.advance(key),
            None => Step::Wait,
        }
    }

    /// Move every repair whose current request has been outstanding for
    /// `timeout` on to its next step.
    pub fn expire(&mut self, timeout: Duration) -> Vec<(ChunkKey, Step)> {
        let stalled: Vec<ChunkKey> = self
            .pending
            .iter()
            .filter(|(_, p)| p.since.elapsed() >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        stalled
            .into_iter()
            .map(|key| {
                tracing::debug!(chunk = %key, "recovery step timed out");
                let step = self.on_unreachable(&key);
                (key, step)
            })
            .collect()
    }

    fn advance(&mut self, key: &ChunkKey) -> Step {
        let Some(p) = self.pending.get_mut(key) else {
            return Step::Wait;
        };
        match p.replicas.pop_front() {
            Some(replica) => {
                p.stage = Stage::Awaiting(replica);
                p.since = Instant::now();
                Step::RequestSlices {
                    replica,
                    failed: p.fault.failed().iter().map(|&i| i as u32).collect(),
                }
            }
            None => self.abandon(key),
        }
    }

    fn abandon(&mut self, key: &ChunkKey) -> Step {
        match self.pending.remove(key) {
            Some(p) => Step::Abandoned {
                failed: p.fault.failed().to_vec(),
                readers: p.readers,
            },
            None => Step::Wait,
        }
    }
}
