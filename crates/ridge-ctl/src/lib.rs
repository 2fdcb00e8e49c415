//! ridge-ctl — client side of the Ridge protocol.
//!
//! A [`Client`] listens on an OS-assigned port for replies and talks to the
//! controller and storage servers one request at a time:
//!
//! ```text
//! write:  WriteRequest → controller → WriteReply(targets)
//!         WriteData(chunk, forward) → first target → … → last target
//! read:   ReadRequest → controller → ReadReply(replica)
//!         ReadDataRequest → replica → ReadData | ReadFailed
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use ridge_core::chunker::{chunk_file, combine};
use ridge_core::config::{ChunkingConfig, RidgeConfig};
use ridge_core::{is_bare_file_name, Chunk, ChunkError, ChunkKey, Message, Placement};
use ridge_services::{Event, Messenger, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("chunk: {0}")]
    Chunk(#[from] ChunkError),

    #[error("not enough storage servers: need {needed}, {available} available")]
    NoTargets { needed: u32, available: u32 },

    #[error("no replica of {0} is known")]
    NoReplica(ChunkKey),

    #[error("server could not read {key}: {reason}")]
    ReadFailed { key: ChunkKey, reason: String },

    #[error("{key} failed verification in slices {failed:?}")]
    Integrity { key: ChunkKey, failed: Vec<usize> },

    #[error("no reply within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("interrupted")]
    Interrupted,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Client {
    messenger: Messenger,
    port: u16,
    controller: SocketAddr,
    timeout: Duration,
    chunking: ChunkingConfig,
}

impl Client {
    /// Bind a reply port on the configured listen IP and start accepting.
    pub async fn connect(config: &RidgeConfig) -> Result<Self, ClientError> {
        let addr = SocketAddr::new(config.network.listen_addr.ip(), 0);
        let messenger = Messenger::bind(addr, config.network.concurrency).await?;
        messenger.listen()?;
        let port = messenger.local_addr().map(|a| a.port()).unwrap_or(0);
        tracing::debug!(port, controller = %config.network.controller_addr, "client ready");
        Ok(Self {
            messenger,
            port,
            controller: config.network.controller_addr,
            timeout: config.client.timeout(),
            chunking: config.chunking.clone(),
        })
    }

    /// Port replies are delivered to.
    pub fn port(&self) -> u16 {
        self.port
    }

    // ── Chunk operations ──────────────────────────────────────────────────

    /// Ask the controller which servers `key` should be written to.
    pub async fn request_write_targets(&self, key: &ChunkKey) -> Result<Vec<SocketAddr>, ClientError> {
        self.messenger.send(
            Message::WriteRequest {
                key: key.clone(),
                port: self.port,
            },
            self.controller,
        );
        self.await_reply(|msg| match msg {
            Message::WriteReply { key: k, placement } if &k == key => Some(match placement {
                Placement::Targets(t) if !t.is_empty() => Ok(t),
                Placement::Targets(_) => Err(ClientError::NoTargets {
                    needed: 1,
                    available: 0,
                }),
                Placement::InsufficientNodes { needed, available } => {
                    Err(ClientError::NoTargets { needed, available })
                }
            }),
            _ => None,
        })
        .await
    }

    /// Send `chunk` down the write pipeline formed by `targets`. Returns
    /// once the first target has the whole chunk.
    pub async fn store_chunk(&self, chunk: &Chunk, targets: &[SocketAddr]) -> Result<(), ClientError> {
        let Some((first, rest)) = targets.split_first() else {
            return Err(ClientError::NoTargets {
                needed: 1,
                available: 0,
            });
        };
        self.messenger.send(
            Message::WriteData {
                chunk: chunk.encode(),
                forward: rest.to_vec(),
            },
            *first,
        );

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next_event(deadline).await? {
                Event::MessageSent {
                    message: Message::WriteData { .. },
                    result,
                    ..
                } => return result.map_err(ClientError::from),
                other => tracing::debug!(event = ?other, "ignoring event while writing"),
            }
        }
    }

    /// Ask the controller for one server holding `key`.
    pub async fn locate(&self, key: &ChunkKey) -> Result<SocketAddr, ClientError> {
        self.messenger.send(
            Message::ReadRequest {
                key: key.clone(),
                port: self.port,
            },
            self.controller,
        );
        self.await_reply(|msg| match msg {
            Message::ReadReply { key: k, replica } if &k == key => {
                Some(replica.ok_or_else(|| ClientError::NoReplica(k)))
            }
            _ => None,
        })
        .await
    }

    /// Read `key` from the server at `from` and verify it.
    pub async fn fetch_chunk(&self, key: &ChunkKey, from: SocketAddr) -> Result<Chunk, ClientError> {
        self.messenger.send(
            Message::ReadDataRequest {
                key: key.clone(),
                port: self.port,
            },
            from,
        );
        self.await_reply(|msg| match msg {
            Message::ReadData { key: k, chunk } if &k == key => {
                Some(Chunk::decode(&chunk).map_err(|e| match e {
                    ChunkError::Integrity(fault) => ClientError::Integrity {
                        key: k,
                        failed: fault.failed().to_vec(),
                    },
                    other => ClientError::Chunk(other),
                }))
            }
            Message::ReadFailed { key: k, reason } if &k == key => {
                Some(Err(ClientError::ReadFailed { key: k, reason }))
            }
            _ => None,
        })
        .await
    }

    /// [`Client::locate`] then [`Client::fetch_chunk`].
    pub async fn read_chunk(&self, key: &ChunkKey) -> Result<Chunk, ClientError> {
        let from = self.locate(key).await?;
        self.fetch_chunk(key, from).await
    }

    // ── File operations ───────────────────────────────────────────────────

    /// Split the file at `path` into chunks and store each one. Returns the
    /// number of chunks written.
    pub async fn write_file(&self, path: &Path) -> Result<u64, ClientError> {
        let chunker = chunk_file(
            path,
            self.chunking.chunk_size,
            self.chunking.slice_size,
            self.chunking.hash,
        )?;
        let mut written = 0u64;
        for chunk in chunker {
            let chunk = chunk?;
            let targets = self.request_write_targets(&chunk.key()).await?;
            self.store_chunk(&chunk, &targets).await?;
            tracing::info!(chunk = %chunk.key(), replicas = targets.len(), "chunk written");
            written += 1;
        }
        if written == 0 {
            return Err(ClientError::Chunk(ChunkError::InvalidArgument(format!(
                "{} is empty",
                path.display()
            ))));
        }
        Ok(written)
    }

    /// Read every chunk of `filename` and reassemble it as
    /// `out_dir/filename`. Returns the path written.
    pub async fn read_file(&self, filename: &str, out_dir: &Path) -> Result<PathBuf, ClientError> {
        if !is_bare_file_name(filename) {
            return Err(ChunkError::InvalidArgument(format!(
                "not a bare file name: {filename:?}"
            ))
            .into());
        }
        let mut chunks = Vec::new();
        for sequence in 0.. {
            let chunk = self.read_chunk(&ChunkKey::new(filename, sequence)).await?;
            let last = chunk.is_last();
            chunks.push(chunk);
            if last {
                break;
            }
        }

        let path = out_dir.join(filename);
        let mut out = BufWriter::new(File::create(&path)?);
        let bytes = combine(chunks, &mut out)?;
        out.flush()?;
        tracing::info!(path = %path.display(), bytes, "file reassembled");
        Ok(path)
    }

    // ── Waiting ───────────────────────────────────────────────────────────

    /// Next event other than an accepted connection, which is handed to
    /// the messenger to read.
    async fn next_event(&self, deadline: Instant) -> Result<Event, ClientError> {
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let event = self
                .messenger
                .get_event_timeout(left)
                .await
                .ok_or(ClientError::Timeout(self.timeout))?;
            match event {
                Event::ConnectionReceived(Ok((stream, _))) => self.messenger.receive(stream),
                Event::ConnectionReceived(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                }
                Event::Interrupted => return Err(ClientError::Interrupted),
                other => return Ok(other),
            }
        }
    }

    /// Wait for the reply `pick` accepts. A failed request send ends the
    /// wait; unrelated messages are skipped.
    async fn await_reply<T>(
        &self,
        mut pick: impl FnMut(Message) -> Option<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next_event(deadline).await? {
                Event::MessageReceived {
                    result: Ok(message),
                    source,
                } => {
                    let kind = message.kind();
                    match pick(message) {
                        Some(result) => return result,
                        None => tracing::debug!(%source, ?kind, "ignoring unrelated message"),
                    }
                }
                Event::MessageReceived {
                    result: Err(e),
                    source,
                } => {
                    tracing::warn!(%source, error = %e, "failed to receive reply");
                }
                Event::MessageSent {
                    result: Err(e),
                    destination,
                    ..
                } => {
                    tracing::warn!(%destination, error = %e, "request undeliverable");
                    return Err(e.into());
                }
                _ => {}
            }
        }
    }
}
