//! Controller — tracks live storage servers and which of them hold each
//! chunk, answers placement and lookup requests, and restores the
//! replication factor when a server disappears.
//!
//! Liveness: every probe interval each tracked server gets a `CheckIfAlive`.
//! A probe that cannot be delivered removes the server and every replica it
//! held. With a node TTL configured, servers whose last report is older
//! than the TTL are removed as well.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use ridge_core::config::RidgeConfig;
use ridge_core::{ChunkKey, Heartbeat, Message, Placement};
use ridge_services::{ClusterState, Event, Messenger, TableError, TransportError};

/// How long in-flight transport operations get to finish on shutdown.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Controller {
    messenger: Arc<Messenger>,
    cluster: Arc<ClusterState>,
    probe_interval: Duration,
    node_ttl: Option<Duration>,
    shutdown: broadcast::Receiver<()>,
}

impl Controller {
    pub async fn bind(
        addr: SocketAddr,
        config: &RidgeConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let messenger = Messenger::bind(addr, config.network.concurrency)
            .await
            .with_context(|| format!("failed to bind controller on {addr}"))?;
        let cluster = ClusterState::new(
            config.replication.factor as usize,
            config.replication.placement,
        );
        Ok(Self {
            messenger: Arc::new(messenger),
            cluster: Arc::new(cluster),
            probe_interval: config.heartbeat.probe_interval(),
            node_ttl: config.heartbeat.node_ttl(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.messenger.local_addr()
    }

    /// Shared handle on the cluster tables.
    pub fn cluster(&self) -> Arc<ClusterState> {
        self.cluster.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        self.messenger.listen()?;
        tracing::info!(
            addr = ?self.messenger.local_addr(),
            factor = self.cluster.replication_factor(),
            probe_secs = self.probe_interval.as_secs_f64(),
            "controller running"
        );

        let mut probe = tokio::time::interval(self.probe_interval);
        // The first tick fires immediately and there is nobody to probe yet.
        probe.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("controller shutting down");
                    break;
                }
                _ = probe.tick() => self.probe(),
                event = self.messenger.get_event() => {
                    if matches!(event, Event::Interrupted) {
                        tracing::info!("controller interrupted");
                        break;
                    }
                    self.handle_event(event);
                }
            }
        }

        if !self.messenger.stop_timeout(STOP_GRACE).await {
            tracing::warn!("transport operations still running at shutdown");
        }
        Ok(())
    }

    // ── Liveness ──────────────────────────────────────────────────────────

    fn probe(&self) {
        if let Some(ttl) = self.node_ttl {
            for (node, lost) in self.cluster.expire_stale(ttl) {
                tracing::warn!(%node, replicas = lost.len(), "server silent past ttl, removed");
                self.rereplicate(lost);
            }
        }
        let nodes = self.cluster.nodes();
        tracing::debug!(nodes = nodes.len(), "probing servers");
        for node in nodes {
            self.messenger.send(Message::CheckIfAlive, node);
        }
    }

    fn node_failed(&self, node: SocketAddr, error: &TransportError) {
        match self.cluster.remove_node(node) {
            Ok(lost) => {
                tracing::warn!(%node, error = %error, replicas = lost.len(), "server unreachable, removed");
                self.rereplicate(lost);
            }
            Err(TableError::NodeUnknown(_)) => {
                tracing::debug!(%node, "probe failed for a server already removed");
            }
            Err(e) => tracing::warn!(%node, error = %e, "failed to remove server"),
        }
    }

    /// Ask a surviving holder of each key to copy it to new servers until
    /// the replication factor is met again.
    fn rereplicate(&self, keys: Vec<ChunkKey>) {
        for key in keys {
            let Some(source) = self.cluster.existing_replica(&key) else {
                tracing::error!(chunk = %key, "last replica gone, chunk lost");
                continue;
            };
            match self.cluster.candidates(&key) {
                Ok(destinations) => {
                    for destination in destinations {
                        tracing::info!(chunk = %key, %source, %destination, "re-replicating");
                        self.messenger.send(
                            Message::TransferRequest {
                                key: key.clone(),
                                destination,
                            },
                            source,
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(chunk = %key, error = %e, "cannot restore replication factor");
                }
            }
        }
    }

    // ── Events ────────────────────────────────────────────────────────────

    fn handle_event(&self, event: Event) {
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
            } => match message {
                Message::CheckIfAlive => self.node_failed(destination, &e),
                Message::TransferRequest { key, .. } => {
                    tracing::warn!(chunk = %key, source = %destination, error = %e, "transfer request undeliverable");
                }
                other => {
                    tracing::debug!(kind = ?other.kind(), %destination, error = %e, "reply undeliverable");
                }
            },
            Event::Interrupted => {}
        }
    }

    fn handle_message(&self, source: SocketAddr, message: Message) {
        match message {
            Message::MajorHeartbeat(heartbeat) => self.major_heartbeat(heartbeat),
            Message::MinorHeartbeat(heartbeat) => self.minor_heartbeat(heartbeat),
            Message::AliveResponse { listening_addr } => {
                if !self.cluster.touch(listening_addr) {
                    tracing::debug!(node = %listening_addr, "alive response from untracked server");
                }
            }
            Message::WriteRequest { key, port } => {
                let placement = self.placement(&key);
                tracing::debug!(chunk = %key, ?placement, "write placement");
                self.messenger.send(
                    Message::WriteReply { key, placement },
                    SocketAddr::new(source.ip(), port),
                );
            }
            Message::ReadRequest { key, port } => {
                let replica = self.cluster.existing_replica(&key);
                tracing::debug!(chunk = %key, ?replica, "read lookup");
                self.messenger.send(
                    Message::ReadReply { key, replica },
                    SocketAddr::new(source.ip(), port),
                );
            }
            Message::RecoveryRequest { key, port } => {
                let requester = SocketAddr::new(source.ip(), port);
                let replicas: Vec<SocketAddr> = self
                    .cluster
                    .all_replicas(&key)
                    .into_iter()
                    .filter(|a| *a != requester)
                    .collect();
                tracing::info!(chunk = %key, %requester, replicas = replicas.len(), "recovery lookup");
                self.messenger
                    .send(Message::RecoveryReply { key, replicas }, requester);
            }
            other => {
                tracing::warn!(%source, kind = ?other.kind(), "unexpected message");
            }
        }
    }

    // ── Heartbeats ────────────────────────────────────────────────────────

    fn major_heartbeat(&self, heartbeat: Heartbeat) {
        let node = heartbeat.listening_addr;
        let joined = !self.cluster.has_node(node);
        let result = if joined {
            self.cluster.add_node(node, heartbeat.free_space)
        } else {
            self.cluster.update_node(node, heartbeat.free_space)
        };
        if let Err(e) = result {
            tracing::warn!(%node, error = %e, "failed to register server");
            return;
        }
        self.record_replicas(&heartbeat);
        if !joined {
            return;
        }

        tracing::info!(
            %node,
            free_space = heartbeat.free_space,
            chunks = heartbeat.total_chunks,
            "server joined"
        );
        // A new server may be what a stalled re-replication was waiting for.
        let lagging: Vec<ChunkKey> = self
            .cluster
            .under_replicated()
            .into_iter()
            .filter(|(_, holders)| !holders.contains(&node))
            .map(|(key, _)| key)
            .collect();
        if !lagging.is_empty() {
            self.rereplicate(lagging);
        }
    }

    fn minor_heartbeat(&self, heartbeat: Heartbeat) {
        let node = heartbeat.listening_addr;
        if !self.cluster.has_node(node) {
            tracing::info!(%node, "minor heartbeat from unknown server, requesting major");
            self.messenger.send(Message::MajorHeartbeatRequest, node);
            return;
        }
        if let Err(e) = self.cluster.update_node(node, heartbeat.free_space) {
            tracing::warn!(%node, error = %e, "failed to update server");
            return;
        }
        self.record_replicas(&heartbeat);
    }

    fn record_replicas(&self, heartbeat: &Heartbeat) {
        let node = heartbeat.listening_addr;
        for meta in &heartbeat.chunks {
            match self.cluster.add_replica(&meta.key(), node) {
                Ok(true) => tracing::debug!(chunk = %meta.key(), %node, "new replica"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(chunk = %meta.key(), %node, error = %e, "failed to record replica");
                }
            }
        }
    }

    // ── Placement ─────────────────────────────────────────────────────────

    /// Every current holder of `key` plus enough new servers to reach the
    /// replication factor.
    fn placement(&self, key: &ChunkKey) -> Placement {
        let mut targets: Vec<SocketAddr> = self.cluster.all_replicas(key).into_iter().collect();
        match self.cluster.candidates(key) {
            Ok(extra) => {
                targets.extend(extra);
                Placement::Targets(targets)
            }
            Err(TableError::InsufficientNodes { needed, available }) => {
                tracing::warn!(chunk = %key, needed, available, "not enough servers for write");
                Placement::InsufficientNodes {
                    needed: needed as u32,
                    available: available as u32,
                }
            }
            Err(e) => {
                tracing::warn!(chunk = %key, error = %e, "placement failed");
                Placement::InsufficientNodes {
                    needed: self.cluster.replication_factor() as u32,
                    available: self.cluster.node_count() as u32,
                }
            }
        }
    }
}
