//! Storage server — holds chunks, heartbeats to the controller, serves
//! reads, and repairs corrupted chunks from other replicas.
//!
//! One event loop owns the server state and drains the messenger's
//! completion queue. Heartbeats go out from a separate task that shares
//! the store and inventory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::broadcast;

use ridge_core::config::RidgeConfig;
use ridge_core::{Chunk, ChunkError, ChunkKey, Heartbeat, Message, Metadata};
use ridge_services::{ChunkInventory, ChunkStore, Event, Messenger, TransportError};

use crate::recovery::{Recoveries, Step, STEP_TIMEOUT};

/// How often stalled recoveries are checked.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long in-flight transport operations get to finish on shutdown.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Run chunk verification or disk work on the current worker without
/// stalling the tasks queued behind it. `block_in_place` needs the
/// multi-threaded runtime; elsewhere `f` runs inline.
fn offload<T>(f: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

// ── Heartbeats ────────────────────────────────────────────────────────────────

/// Builds and sends heartbeats. Shared by the heartbeat loop and the event
/// loop, which sends an immediate major heartbeat when the controller asks.
#[derive(Clone)]
struct Beacon {
    messenger: Arc<Messenger>,
    store: ChunkStore,
    inventory: ChunkInventory,
    advertised: SocketAddr,
    controller: SocketAddr,
}

impl Beacon {
    fn send(&self, major: bool) {
        let free_space = self.store.free_space().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to read free space");
            0
        });
        let chunks = if major {
            // Everything goes out anyway; the fresh list starts over.
            self.inventory.take_new();
            self.inventory.all()
        } else {
            self.inventory.take_new()
        };
        let heartbeat = Heartbeat {
            listening_addr: self.advertised,
            free_space,
            total_chunks: self.inventory.len() as u64,
            chunks,
        };
        tracing::debug!(
            major,
            reported = heartbeat.chunks.len(),
            total = heartbeat.total_chunks,
            free_space,
            "heartbeat"
        );
        let message = if major {
            Message::MajorHeartbeat(heartbeat)
        } else {
            Message::MinorHeartbeat(heartbeat)
        };
        self.messenger.send(message, self.controller);
    }
}

async fn heartbeat_loop(
    beacon: Beacon,
    interval: Duration,
    minor_per_major: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut beat: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("heartbeat loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                beacon.send(beat % u64::from(minor_per_major.max(1)) == 0);
                beat += 1;
            }
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct Server {
    messenger: Arc<Messenger>,
    beacon: Beacon,
    store: ChunkStore,
    inventory: ChunkInventory,
    recoveries: Recoveries,
    advertised: SocketAddr,
    controller: SocketAddr,
    interval: Duration,
    minor_per_major: u32,
    shutdown: broadcast::Receiver<()>,
}

impl Server {
    /// Bind the listening socket, open the chunk store, and load the chunks
    /// already on disk into the inventory.
    pub async fn bind(config: &RidgeConfig, shutdown: broadcast::Receiver<()>) -> Result<Self> {
        let net = &config.network;
        let messenger = Messenger::bind(net.listen_addr, net.concurrency)
            .await
            .with_context(|| format!("failed to bind {}", net.listen_addr))?;
        let bound = messenger
            .local_addr()
            .context("bound messenger has no address")?;
        let advertised = net.advertised(bound);

        let store = ChunkStore::new(&config.storage.path)?;
        let inventory = ChunkInventory::new();
        let existing = store.scan()?;
        tracing::info!(
            root = %store.root().display(),
            chunks = existing.len(),
            "chunk store opened"
        );
        inventory.restore(existing);

        let messenger = Arc::new(messenger);
        let beacon = Beacon {
            messenger: messenger.clone(),
            store: store.clone(),
            inventory: inventory.clone(),
            advertised,
            controller: net.controller_addr,
        };

        Ok(Self {
            messenger,
            beacon,
            store,
            inventory,
            recoveries: Recoveries::new(advertised),
            advertised,
            controller: net.controller_addr,
            interval: config.heartbeat.interval(),
            minor_per_major: config.heartbeat.minor_per_major,
            shutdown,
        })
    }

    /// Address this server reports to the controller.
    pub fn local_addr(&self) -> SocketAddr {
        self.advertised
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn inventory(&self) -> &ChunkInventory {
        &self.inventory
    }

    pub async fn run(mut self) -> Result<()> {
        self.messenger.listen()?;
        tracing::info!(
            addr = %self.advertised,
            controller = %self.controller,
            "server running"
        );

        let heartbeats = tokio::spawn(heartbeat_loop(
            self.beacon.clone(),
            self.interval,
            self.minor_per_major,
            self.shutdown.resubscribe(),
        ));
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }
                _ = sweep.tick() => {
                    for (key, step) in self.recoveries.expire(STEP_TIMEOUT) {
                        self.apply(key, step);
                    }
                }
                event = self.messenger.get_event() => {
                    if matches!(event, Event::Interrupted) {
                        tracing::info!("server interrupted");
                        break;
                    }
                    self.handle_event(event);
                }
            }
        }

        heartbeats.abort();
        if !self.messenger.stop_timeout(STOP_GRACE).await {
            tracing::warn!("transport operations still running at shutdown");
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ConnectionReceived(Ok((stream, _))) => self.messenger.receive(stream),
            Event::ConnectionReceived(Err(e)) => {
                tracing::warn!(error = %e, "accept failed");
            }
            Event::MessageReceived {
                source,
                result: Ok(message),
            } => self.handle_message(source, message),
            Event::MessageReceived {
                source,
                result: Err(e),
            } => {
                tracing::warn!(%source, error = %e, "failed to receive message");
            }
            Event::MessageSent { result: Ok(()), .. } => {}
            Event::MessageSent {
                message,
                destination,
                result: Err(e),
            } => self.handle_send_failure(message, destination, e),
            Event::Interrupted => {}
        }
    }

    fn handle_send_failure(&mut self, message: Message, destination: SocketAddr, error: TransportError) {
        match message {
            Message::RecoveryRequest { key, .. } | Message::RecoveryDataRequest { key, .. } => {
                tracing::warn!(chunk = %key, %destination, error = %error, "recovery request undeliverable");
                let step = self.recoveries.on_unreachable(&key);
                self.apply(key, step);
            }
            Message::MajorHeartbeat(_) | Message::MinorHeartbeat(_) => {
                tracing::warn!(controller = %destination, error = %error, "heartbeat undeliverable");
            }
            Message::WriteData { .. } => {
                tracing::warn!(next = %destination, error = %error, "write pipeline broken");
            }
            other => {
                tracing::debug!(kind = ?other.kind(), %destination, error = %error, "send failed");
            }
        }
    }

    fn handle_message(&mut self, source: SocketAddr, message: Message) {
        match message {
            Message::CheckIfAlive => {
                self.messenger.send(
                    Message::AliveResponse {
                        listening_addr: self.advertised,
                    },
                    self.controller,
                );
            }
            Message::MajorHeartbeatRequest => {
                tracing::info!("controller requested a major heartbeat");
                self.beacon.send(true);
            }
            Message::WriteData { chunk, forward } => self.handle_write(chunk, forward),
            Message::TransferData { chunk } => match self.accept_chunk(&chunk) {
                Ok(meta) => tracing::info!(chunk = %meta.key(), "replica received by transfer"),
                Err(e) => tracing::warn!(%source, error = %e, "rejected transferred chunk"),
            },
            Message::TransferRequest { key, destination } => self.handle_transfer(key, destination),
            Message::ReadDataRequest { key, port } => {
                self.handle_read(key, SocketAddr::new(source.ip(), port));
            }
            Message::RecoveryReply { key, replicas } => {
                let step = self.recoveries.on_replicas(&key, replicas);
                self.apply(key, step);
            }
            Message::RecoveryDataRequest { key, failed, port } => {
                let slices = self.healthy_slices(&key, &failed).unwrap_or_default();
                if slices.is_empty() {
                    tracing::debug!(chunk = %key, ?failed, "cannot supply requested slices");
                }
                self.messenger.send(
                    Message::RecoveryData {
                        key,
                        replica: self.advertised,
                        slices,
                    },
                    SocketAddr::new(source.ip(), port),
                );
            }
            Message::RecoveryData {
                key,
                replica,
                slices,
            } => {
                let step = self.recoveries.on_slices(&key, replica, slices);
                self.apply(key, step);
            }
            other => {
                tracing::warn!(%source, kind = ?other.kind(), "unexpected message");
            }
        }
    }

    // ── Writes ────────────────────────────────────────────────────────────

    /// Verify, store, and record an encoded chunk.
    ///
    /// A chunk for a key already held that does not carry a newer version
    /// is an overwrite: it is stored as the held version plus one.
    fn accept_chunk(&self, encoded: &Bytes) -> Result<Metadata> {
        offload(|| -> Result<Metadata> {
            let mut chunk = Chunk::decode(encoded).context("chunk failed verification")?;
            let key = chunk.key();
            let stored = match self.inventory.get(&key) {
                Some(held) if chunk.metadata().version <= held.version => {
                    let meta = chunk.metadata_mut();
                    meta.version = held.version;
                    meta.bump_version();
                    chunk.encode()
                }
                _ => encoded.clone(),
            };
            self.store.put(&key, &stored)?;
            let meta = chunk.metadata().clone();
            self.inventory.record(meta.clone());
            Ok(meta)
        })
    }

    /// Store the chunk, then pass it to the next node in the pipeline.
    fn handle_write(&self, chunk: Bytes, forward: Vec<SocketAddr>) {
        match self.accept_chunk(&chunk) {
            Ok(meta) => {
                tracing::info!(
                    chunk = %meta.key(),
                    version = meta.version,
                    remaining = forward.len(),
                    "chunk stored"
                );
                if let Some((next, rest)) = forward.split_first() {
                    self.messenger.send(
                        Message::WriteData {
                            chunk,
                            forward: rest.to_vec(),
                        },
                        *next,
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "rejected chunk write");
            }
        }
    }

    fn handle_transfer(&self, key: ChunkKey, destination: SocketAddr) {
        let encoded = match self.store.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(chunk = %key, "transfer requested for a chunk not held");
                return;
            }
            Err(e) => {
                tracing::warn!(chunk = %key, error = %e, "failed to load chunk for transfer");
                return;
            }
        };
        if let Err(e) = offload(|| Chunk::decode(&encoded)) {
            tracing::warn!(chunk = %key, error = %e, "refusing to transfer a chunk that fails verification");
            return;
        }
        tracing::info!(chunk = %key, %destination, "transferring replica");
        self.messenger
            .send(Message::TransferData { chunk: encoded }, destination);
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    fn handle_read(&mut self, key: ChunkKey, reader: SocketAddr) {
        let encoded = match self.store.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.read_failed(key, "chunk not stored here".into(), &[reader]);
                return;
            }
            Err(e) => {
                self.read_failed(key, format!("{e:#}"), &[reader]);
                return;
            }
        };

        match offload(|| Chunk::decode(&encoded)) {
            Ok(_) => {
                tracing::debug!(chunk = %key, %reader, "serving chunk");
                self.messenger.send(
                    Message::ReadData {
                        key,
                        chunk: encoded,
                    },
                    reader,
                );
            }
            Err(ChunkError::Integrity(fault)) => {
                tracing::warn!(chunk = %key, failed = ?fault.failed(), "stored chunk is corrupt, recovering");
                let step = self.recoveries.begin(*fault, reader);
                self.apply(key, step);
            }
            Err(e) => self.read_failed(key, e.to_string(), &[reader]),
        }
    }

    fn read_failed(&self, key: ChunkKey, reason: String, readers: &[SocketAddr]) {
        tracing::warn!(chunk = %key, %reason, "read failed");
        for reader in readers {
            self.messenger.send(
                Message::ReadFailed {
                    key: key.clone(),
                    reason: reason.clone(),
                },
                *reader,
            );
        }
    }

    /// The requested slices of a local copy, provided every one of them is
    /// present and verifies. `None` otherwise.
    fn healthy_slices(&self, key: &ChunkKey, wanted: &[u32]) -> Option<Vec<(u32, Bytes)>> {
        let encoded = self.store.get(key).ok()??;
        let (chunk, bad) = match offload(|| Chunk::decode(&encoded)) {
            Ok(chunk) => (chunk, Vec::new()),
            Err(ChunkError::Integrity(fault)) => {
                let bad = fault.failed().to_vec();
                (fault.into_chunk(), bad)
            }
            Err(_) => return None,
        };
        wanted
            .iter()
            .map(|&i| {
                let index = i as usize;
                if bad.contains(&index) {
                    return None;
                }
                chunk
                    .slice(index)
                    .map(|s| (i, Bytes::copy_from_slice(s.data())))
            })
            .collect()
    }

    // ── Recovery ──────────────────────────────────────────────────────────

    fn apply(&mut self, key: ChunkKey, step: Step) {
        match step {
            Step::LocateReplicas => {
                self.messenger.send(
                    Message::RecoveryRequest {
                        key,
                        port: self.advertised.port(),
                    },
                    self.controller,
                );
            }
            Step::RequestSlices { replica, failed } => {
                tracing::debug!(chunk = %key, %replica, ?failed, "requesting slices");
                self.messenger.send(
                    Message::RecoveryDataRequest {
                        key,
                        failed,
                        port: self.advertised.port(),
                    },
                    replica,
                );
            }
            Step::Repaired { chunk, readers } => {
                let encoded = chunk.encode();
                if let Err(e) = offload(|| self.store.put(&key, &encoded)) {
                    tracing::warn!(chunk = %key, error = %e, "failed to persist repaired chunk");
                }
                tracing::info!(chunk = %key, readers = readers.len(), "chunk repaired");
                for reader in readers {
                    self.messenger.send(
                        Message::ReadData {
                            key: key.clone(),
                            chunk: encoded.clone(),
                        },
                        reader,
                    );
                }
            }
            Step::Abandoned { failed, readers } => {
                tracing::error!(chunk = %key, ?failed, "no replica could repair chunk");
                self.read_failed(
                    key,
                    format!("slices {failed:?} are corrupt and could not be recovered"),
                    &readers,
                );
            }
            Step::Wait => {}
        }
    }
}
