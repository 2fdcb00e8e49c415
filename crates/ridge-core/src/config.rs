//! Configuration system for Ridge.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RIDGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ridge/config.toml
//!   3. ~/.config/ridge/config.toml
//!
//! Every node role reads the same file and uses the sections it needs.
//! [`RidgeConfig::validate`] must pass before a node starts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hash::HashKind;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeConfig {
    pub network: NetworkConfig,
    pub heartbeat: HeartbeatConfig,
    pub replication: ReplicationConfig,
    pub chunking: ChunkingConfig,
    pub storage: StorageConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept connections on. Port 0 = OS-assigned.
    pub listen_addr: SocketAddr,
    /// Address other nodes should use to reach this one. Unspecified IP =
    /// derive from `listen_addr`, falling back to loopback.
    pub advertise_ip: IpAddr,
    /// Where the controller listens.
    pub controller_addr: SocketAddr,
    /// Concurrent transport operations per node.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds between server heartbeats.
    pub interval_secs: u64,
    /// Seconds between controller liveness probes.
    pub probe_interval_secs: u64,
    /// Every Nth heartbeat is major; the rest are minor.
    pub minor_per_major: u32,
    /// Drop nodes silent for this many seconds. 0 = only drop on failed probe.
    pub node_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// Pick uniformly among eligible nodes.
    #[default]
    Uniform,
    /// Prefer nodes reporting more free space.
    FreeSpace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub factor: u32,
    pub placement: PlacementPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub slice_size: usize,
    pub hash: HashKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one file per stored chunk.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds to wait for any single reply.
    pub timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Default controller port.
pub const CONTROLLER_PORT: u16 = 7100;

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            advertise_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            controller_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), CONTROLLER_PORT),
            concurrency: 4,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_interval_secs: 10,
            minor_per_major: 10,
            node_ttl_secs: 0,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: 3,
            placement: PlacementPolicy::Uniform,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            slice_size: 8 * 1024,
            hash: HashKind::Blake3,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("chunks"),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl NetworkConfig {
    /// Address to put in heartbeats and replies for a node bound to `bound`.
    pub fn advertised(&self, bound: SocketAddr) -> SocketAddr {
        let ip = if !self.advertise_ip.is_unspecified() {
            self.advertise_ip
        } else if !bound.ip().is_unspecified() {
            bound.ip()
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        SocketAddr::new(ip, bound.port())
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// `None` when TTL expiry is disabled.
    pub fn node_ttl(&self) -> Option<Duration> {
        (self.node_ttl_secs > 0).then(|| Duration::from_secs(self.node_ttl_secs))
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ridge")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ridge")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RidgeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RidgeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RidgeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Check every value a node relies on. A failure here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.network.concurrency == 0 {
            return invalid("network.concurrency must be positive".into());
        }
        if self.network.controller_addr.port() == 0 {
            return invalid("network.controller_addr needs a port".into());
        }
        if self.heartbeat.interval_secs == 0 {
            return invalid("heartbeat.interval_secs must be positive".into());
        }
        if self.heartbeat.probe_interval_secs == 0 {
            return invalid("heartbeat.probe_interval_secs must be positive".into());
        }
        if self.heartbeat.minor_per_major == 0 {
            return invalid("heartbeat.minor_per_major must be positive".into());
        }
        if self.replication.factor == 0 {
            return invalid("replication.factor must be positive".into());
        }
        let ChunkingConfig {
            chunk_size,
            slice_size,
            ..
        } = self.chunking;
        if chunk_size == 0 || slice_size == 0 {
            return invalid("chunking sizes must be positive".into());
        }
        if chunk_size % slice_size != 0 {
            return invalid(format!(
                "chunking.chunk_size {chunk_size} is not a multiple of slice_size {slice_size}"
            ));
        }
        if slice_size > u32::MAX as usize {
            return invalid("chunking.slice_size does not fit the chunk encoding".into());
        }
        if self.client.timeout_secs == 0 {
            return invalid("client.timeout_secs must be positive".into());
        }
        Ok(())
    }

    /// Apply RIDGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        override_parsed("RIDGE_NETWORK__LISTEN_ADDR", &mut self.network.listen_addr);
        override_parsed("RIDGE_NETWORK__ADVERTISE_IP", &mut self.network.advertise_ip);
        override_parsed("RIDGE_NETWORK__CONTROLLER_ADDR", &mut self.network.controller_addr);
        override_parsed("RIDGE_NETWORK__CONCURRENCY", &mut self.network.concurrency);
        override_parsed("RIDGE_HEARTBEAT__INTERVAL_SECS", &mut self.heartbeat.interval_secs);
        override_parsed(
            "RIDGE_HEARTBEAT__PROBE_INTERVAL_SECS",
            &mut self.heartbeat.probe_interval_secs,
        );
        override_parsed("RIDGE_HEARTBEAT__MINOR_PER_MAJOR", &mut self.heartbeat.minor_per_major);
        override_parsed("RIDGE_HEARTBEAT__NODE_TTL_SECS", &mut self.heartbeat.node_ttl_secs);
        override_parsed("RIDGE_REPLICATION__FACTOR", &mut self.replication.factor);
        override_parsed("RIDGE_CHUNKING__CHUNK_SIZE", &mut self.chunking.chunk_size);
        override_parsed("RIDGE_CHUNKING__SLICE_SIZE", &mut self.chunking.slice_size);
        override_parsed("RIDGE_CHUNKING__HASH", &mut self.chunking.hash);
        override_parsed("RIDGE_CLIENT__TIMEOUT_SECS", &mut self.client.timeout_secs);
        if let Ok(v) = std::env::var("RIDGE_REPLICATION__PLACEMENT") {
            match v.as_str() {
                "uniform" => self.replication.placement = PlacementPolicy::Uniform,
                "free_space" => self.replication.placement = PlacementPolicy::FreeSpace,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("RIDGE_STORAGE__PATH") {
            self.storage.path = PathBuf::from(v);
        }
    }
}

/// Overwrite `slot` with the parsed value of `var` if set and parseable.
fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}
