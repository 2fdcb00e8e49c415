//! Ridge integration test harness.
//!
//! Every test runs a whole cluster in-process: one controller and a few
//! storage servers on 127.0.0.1 with OS-assigned ports, short heartbeat
//! and probe intervals, and throwaway storage directories.
//!
//!   cargo test --test integration
//!
//! Each test owns its cluster; dropping the cluster shuts every node down
//! and removes its directories.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ridge_core::config::RidgeConfig;
use ridge_core::{Chunk, ChunkError, ChunkKey};
use ridge_ctl::Client;
use ridge_services::{ChunkStore, ClusterState};
use ridged::{Controller, Server};

mod cluster;
mod failures;
mod repair;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// How long any cluster-level condition gets to become true.
pub const SETTLE: Duration = Duration::from_secs(15);

pub struct ServerNode {
    pub addr: SocketAddr,
    pub storage: PathBuf,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerNode {
    pub fn store(&self) -> ChunkStore {
        ChunkStore::new(&self.storage).expect("storage dir")
    }
}

pub struct TestCluster {
    pub controller: SocketAddr,
    pub cluster: Arc<ClusterState>,
    pub servers: Vec<ServerNode>,
    config: RidgeConfig,
    root: PathBuf,
    controller_shutdown: broadcast::Sender<()>,
}

/// Config shared by every node of a test cluster.
pub fn test_config(factor: u32) -> RidgeConfig {
    let mut config = RidgeConfig::default();
    config.network.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.heartbeat.interval_secs = 1;
    config.heartbeat.probe_interval_secs = 1;
    config.heartbeat.minor_per_major = 3;
    config.replication.factor = factor;
    config.client.timeout_secs = 10;
    config
}

impl TestCluster {
    /// Start a controller and `servers` storage servers, and wait until the
    /// controller knows every server.
    pub async fn start(servers: usize, config: RidgeConfig) -> Result<Self> {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!("ridge-it-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root)?;

        let (controller_shutdown, rx) = broadcast::channel(1);
        let controller = Controller::bind(config.network.listen_addr, &config, rx).await?;
        let controller_addr = controller.local_addr().context("controller has no address")?;
        let cluster = controller.cluster();
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                eprintln!("controller failed: {e:#}");
            }
        });

        let mut config = config;
        config.network.controller_addr = controller_addr;

        let mut tc = Self {
            controller: controller_addr,
            cluster,
            servers: Vec::new(),
            config,
            root,
            controller_shutdown,
        };
        for i in 0..servers {
            let storage = tc.root.join(format!("server-{i}"));
            tc.spawn_server(storage).await?;
        }
        anyhow::ensure!(
            wait_until(SETTLE, || tc.cluster.node_count() == servers).await,
            "only {} of {servers} servers joined",
            tc.cluster.node_count()
        );
        Ok(tc)
    }

    /// Start one more server on `storage`, which may already hold chunks.
    pub async fn spawn_server(&mut self, storage: PathBuf) -> Result<SocketAddr> {
        let mut config = self.config.clone();
        config.storage.path = storage.clone();
        let (shutdown, rx) = broadcast::channel(1);
        let server = Server::bind(&config, rx).await?;
        let addr = server.local_addr();
        let task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                eprintln!("server failed: {e:#}");
            }
        });
        self.servers.push(ServerNode {
            addr,
            storage,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Stop the server at `addr` and wait for its socket to close. Returns
    /// its storage directory.
    pub async fn kill(&mut self, addr: SocketAddr) -> Result<PathBuf> {
        let pos = self
            .servers
            .iter()
            .position(|s| s.addr == addr)
            .context("no such server")?;
        let node = self.servers.remove(pos);
        let _ = node.shutdown.send(());
        tokio::time::timeout(SETTLE, node.task)
            .await
            .context("server did not stop")??;
        Ok(node.storage)
    }

    pub fn server(&self, addr: SocketAddr) -> Option<&ServerNode> {
        self.servers.iter().find(|s| s.addr == addr)
    }

    pub async fn client(&self) -> Result<Client> {
        Ok(Client::connect(&self.config).await?)
    }

    pub fn scratch(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Wait until the controller records exactly `count` replicas of `key`.
    pub async fn await_replicas(&self, key: &ChunkKey, count: usize) -> bool {
        wait_until(SETTLE, || self.cluster.all_replicas(key).len() == count).await
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.controller_shutdown.send(());
        for s in &self.servers {
            let _ = s.shutdown.send(());
        }
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Poll `check` every 100ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// A file of `len` bytes with a recognisable pattern.
pub fn write_sample(path: &Path, len: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i * 7 + i / 251) as u8).collect();
    std::fs::write(path, &data).expect("write sample file");
    data
}

/// Flip one byte in slice `slice` of the chunk stored under `key`. The
/// digests are left alone, so that slice no longer verifies.
pub fn corrupt_slice(store: &ChunkStore, key: &ChunkKey, slice: usize) {
    let encoded = store.get(key).unwrap().expect("chunk stored");
    let chunk = match Chunk::decode(&encoded) {
        Ok(chunk) => chunk,
        Err(ChunkError::Integrity(fault)) => fault.into_chunk(),
        Err(e) => panic!("stored chunk is malformed: {e}"),
    };
    let mut bytes = encoded.to_vec();
    let payload = bytes.len() - chunk.data_len();
    bytes[payload + slice * chunk.slice_size()] ^= 0xFF;
    store.put(key, &bytes).unwrap();
}
