//! Cluster state — the controller's view of live storage nodes and of which
//! nodes hold which chunk replicas.
//!
//! Both tables live behind one lock so that every operation is atomic with
//! respect to every other: a node removal and a concurrent replica report
//! can never leave a replica set pointing at a node that is gone.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::seq::{IteratorRandom, SliceRandom};

use ridge_core::config::PlacementPolicy;
use ridge_core::ChunkKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("node {0} is already tracked")]
    NodeExists(SocketAddr),

    #[error("node {0} is not tracked")]
    NodeUnknown(SocketAddr),

    #[error("need {needed} more nodes, only {available} eligible")]
    InsufficientNodes { needed: usize, available: usize },
}

/// One tracked storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub free_space: u64,
    /// When the node last reported in.
    pub last_seen: Instant,
}

#[derive(Default)]
struct Tables {
    nodes: HashMap<SocketAddr, NodeRecord>,
    replicas: HashMap<ChunkKey, HashSet<SocketAddr>>,
}

pub struct ClusterState {
    tables: Mutex<Tables>,
    factor: usize,
    policy: PlacementPolicy,
}

impl ClusterState {
    pub fn new(factor: usize, policy: PlacementPolicy) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            factor,
            policy,
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.factor
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Nodes ─────────────────────────────────────────────────────────────

    pub fn add_node(&self, addr: SocketAddr, free_space: u64) -> Result<(), TableError> {
        let mut t = self.lock();
        if t.nodes.contains_key(&addr) {
            return Err(TableError::NodeExists(addr));
        }
        t.nodes.insert(
            addr,
            NodeRecord {
                free_space,
                last_seen: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn update_node(&self, addr: SocketAddr, free_space: u64) -> Result<(), TableError> {
        let mut t = self.lock();
        let record = t.nodes.get_mut(&addr).ok_or(TableError::NodeUnknown(addr))?;
        record.free_space = free_space;
        record.last_seen = Instant::now();
        Ok(())
    }

    /// Remove a node and purge it from every replica set.
    ///
    /// Returns the keys of the chunks that lost a replica.
    pub fn remove_node(&self, addr: SocketAddr) -> Result<Vec<ChunkKey>, TableError> {
        let mut t = self.lock();
        if t.nodes.remove(&addr).is_none() {
            return Err(TableError::NodeUnknown(addr));
        }
        Ok(purge(&mut t, addr))
    }

    /// Mark a tracked node as alive now. Returns false if it is not tracked.
    pub fn touch(&self, addr: SocketAddr) -> bool {
        match self.lock().nodes.get_mut(&addr) {
            Some(record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn has_node(&self, addr: SocketAddr) -> bool {
        self.lock().nodes.contains_key(&addr)
    }

    pub fn node(&self, addr: SocketAddr) -> Option<NodeRecord> {
        self.lock().nodes.get(&addr).cloned()
    }

    pub fn nodes(&self) -> Vec<SocketAddr> {
        self.lock().nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Remove every node not heard from within `ttl`. Returns each removed
    /// node with the chunks that lost a replica.
    pub fn expire_stale(&self, ttl: Duration) -> Vec<(SocketAddr, Vec<ChunkKey>)> {
        let mut t = self.lock();
        let stale: Vec<SocketAddr> = t
            .nodes
            .iter()
            .filter(|(_, r)| r.last_seen.elapsed() >= ttl)
            .map(|(a, _)| *a)
            .collect();
        stale
            .into_iter()
            .map(|addr| {
                t.nodes.remove(&addr);
                let lost = purge(&mut t, addr);
                (addr, lost)
            })
            .collect()
    }

    // ── Replicas ──────────────────────────────────────────────────────────

    /// Record that `addr` holds `key`. Returns true if this is news.
    pub fn add_replica(&self, key: &ChunkKey, addr: SocketAddr) -> Result<bool, TableError> {
        let mut t = self.lock();
        if !t.nodes.contains_key(&addr) {
            return Err(TableError::NodeUnknown(addr));
        }
        Ok(t.replicas.entry(key.clone()).or_default().insert(addr))
    }

    /// Every node known to hold `key`. Empty if none.
    pub fn all_replicas(&self, key: &ChunkKey) -> HashSet<SocketAddr> {
        self.lock().replicas.get(key).cloned().unwrap_or_default()
    }

    /// One holder of `key`, chosen uniformly at random.
    pub fn existing_replica(&self, key: &ChunkKey) -> Option<SocketAddr> {
        let t = self.lock();
        t.replicas
            .get(key)?
            .iter()
            .copied()
            .choose(&mut rand::thread_rng())
    }

    /// Nodes to add so `key` reaches the replication factor.
    ///
    /// Never includes a node that already holds `key`. Empty when the
    /// target is already met. Fails when fewer eligible nodes exist than
    /// are still needed.
    pub fn candidates(&self, key: &ChunkKey) -> Result<HashSet<SocketAddr>, TableError> {
        let t = self.lock();
        let empty = HashSet::new();
        let holders = t.replicas.get(key).unwrap_or(&empty);

        let needed = self.factor.saturating_sub(holders.len());
        if needed == 0 {
            return Ok(HashSet::new());
        }

        let eligible: Vec<(SocketAddr, u64)> = t
            .nodes
            .iter()
            .filter(|(a, _)| !holders.contains(a))
            .map(|(a, r)| (*a, r.free_space))
            .collect();
        if eligible.len() < needed {
            return Err(TableError::InsufficientNodes {
                needed,
                available: eligible.len(),
            });
        }

        let mut rng = rand::thread_rng();
        let picked: HashSet<SocketAddr> = match self.policy {
            PlacementPolicy::Uniform => eligible
                .choose_multiple(&mut rng, needed)
                .map(|(a, _)| *a)
                .collect(),
            PlacementPolicy::FreeSpace => {
                match eligible.choose_multiple_weighted(&mut rng, needed, |(_, free)| {
                    *free as f64 + 1.0
                }) {
                    Ok(iter) => iter.map(|(a, _)| *a).collect(),
                    Err(_) => eligible
                        .choose_multiple(&mut rng, needed)
                        .map(|(a, _)| *a)
                        .collect(),
                }
            }
        };
        Ok(picked)
    }

    /// Chunks with at least one replica but fewer than the replication
    /// factor, with their current holders.
    pub fn under_replicated(&self) -> Vec<(ChunkKey, HashSet<SocketAddr>)> {
        self.lock()
            .replicas
            .iter()
            .filter(|(_, set)| !set.is_empty() && set.len() < self.factor)
            .map(|(k, set)| (k.clone(), set.clone()))
            .collect()
    }

    /// Forget every node and replica.
    pub fn reset(&self) {
        let mut t = self.lock();
        t.nodes.clear();
        t.replicas.clear();
    }
}

/// Drop `addr` from every replica set. Returns the affected keys.
fn purge(t: &mut Tables, addr: SocketAddr) -> Vec<ChunkKey> {
    let mut lost = Vec::new();
    for (key, set) in t.replicas.iter_mut() {
        if set.remove(&addr) {
            lost.push(key.clone());
        }
    }
    lost
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn key(seq: u64) -> ChunkKey {
        ChunkKey::new("movie.mkv", seq)
    }

    fn cluster(nodes: u16) -> ClusterState {
        let c = ClusterState::new(3, PlacementPolicy::Uniform);
        for p in 1..=nodes {
            c.add_node(addr(p), 1000).unwrap();
        }
        c
    }

    #[test]
    fn add_and_update_validate_presence() {
        let c = cluster(0);
        assert_eq!(c.update_node(addr(1), 5), Err(TableError::NodeUnknown(addr(1))));
        c.add_node(addr(1), 5).unwrap();
        assert_eq!(c.add_node(addr(1), 5), Err(TableError::NodeExists(addr(1))));
        c.update_node(addr(1), 99).unwrap();
        assert_eq!(c.node(addr(1)).unwrap().free_space, 99);
    }

    #[test]
    fn three_nodes_all_become_candidates() {
        let c = cluster(3);
        let picked = c.candidates(&key(0)).unwrap();
        assert_eq!(picked, [addr(1), addr(2), addr(3)].into_iter().collect());

        for p in 1..=3 {
            assert!(c.add_replica(&key(0), addr(p)).unwrap());
        }
        assert!(!c.add_replica(&key(0), addr(2)).unwrap());
        assert!(c.candidates(&key(0)).unwrap().is_empty());
    }

    #[test]
    fn candidates_exclude_holders() {
        let c = cluster(5);
        c.add_replica(&key(1), addr(2)).unwrap();
        for _ in 0..50 {
            let picked = c.candidates(&key(1)).unwrap();
            assert_eq!(picked.len(), 2);
            assert!(!picked.contains(&addr(2)));
        }
    }

    #[test]
    fn insufficient_nodes_is_distinct_from_target_met() {
        let c = cluster(2);
        assert_eq!(
            c.candidates(&key(0)),
            Err(TableError::InsufficientNodes { needed: 3, available: 2 })
        );

        c.add_replica(&key(0), addr(1)).unwrap();
        assert_eq!(
            c.candidates(&key(0)),
            Err(TableError::InsufficientNodes { needed: 2, available: 1 })
        );
    }

    #[test]
    fn free_space_policy_still_excludes_holders() {
        let c = ClusterState::new(2, PlacementPolicy::FreeSpace);
        c.add_node(addr(1), 0).unwrap();
        c.add_node(addr(2), 1 << 30).unwrap();
        c.add_node(addr(3), 1 << 30).unwrap();
        c.add_replica(&key(0), addr(3)).unwrap();
        let picked = c.candidates(&key(0)).unwrap();
        assert_eq!(picked.len(), 1);
        assert!(!picked.contains(&addr(3)));
    }

    #[test]
    fn remove_node_purges_every_replica_set() {
        let c = cluster(3);
        for seq in 0..10 {
            c.add_replica(&key(seq), addr(1)).unwrap();
            c.add_replica(&key(seq), addr(2)).unwrap();
        }
        let lost = c.remove_node(addr(1)).unwrap();
        assert_eq!(lost.len(), 10);
        for seq in 0..10 {
            assert!(!c.all_replicas(&key(seq)).contains(&addr(1)));
        }
        assert_eq!(c.remove_node(addr(1)), Err(TableError::NodeUnknown(addr(1))));
    }

    #[test]
    fn sole_replica_lost_means_no_replica() {
        let c = cluster(3);
        c.add_replica(&key(7), addr(3)).unwrap();
        assert_eq!(c.existing_replica(&key(7)), Some(addr(3)));
        c.remove_node(addr(3)).unwrap();
        assert_eq!(c.existing_replica(&key(7)), None);
        assert!(c.all_replicas(&key(7)).is_empty());
    }

    #[test]
    fn replica_for_unknown_node_rejected() {
        let c = cluster(1);
        assert_eq!(
            c.add_replica(&key(0), addr(9)),
            Err(TableError::NodeUnknown(addr(9)))
        );
    }

    #[test]
    fn existing_replica_is_a_holder() {
        let c = cluster(4);
        c.add_replica(&key(0), addr(2)).unwrap();
        c.add_replica(&key(0), addr(4)).unwrap();
        for _ in 0..20 {
            let r = c.existing_replica(&key(0)).unwrap();
            assert!(r == addr(2) || r == addr(4));
        }
    }

    #[test]
    fn under_replicated_lists_short_chunks() {
        let c = cluster(3);
        for p in 1..=3 {
            c.add_replica(&key(0), addr(p)).unwrap();
        }
        c.add_replica(&key(1), addr(1)).unwrap();
        let short = c.under_replicated();
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].0, key(1));
    }

    #[test]
    fn expire_stale_removes_silent_nodes() {
        let c = cluster(2);
        c.add_replica(&key(0), addr(1)).unwrap();
        assert!(c.expire_stale(Duration::from_secs(60)).is_empty());

        let removed = c.expire_stale(Duration::ZERO);
        assert_eq!(removed.len(), 2);
        assert_eq!(c.node_count(), 0);
        assert!(c.all_replicas(&key(0)).is_empty());
    }

    #[test]
    fn touch_only_known_nodes() {
        let c = cluster(1);
        assert!(c.touch(addr(1)));
        assert!(!c.touch(addr(2)));
    }

    #[test]
    fn reset_clears_everything() {
        let c = cluster(3);
        c.add_replica(&key(0), addr(1)).unwrap();
        c.reset();
        assert_eq!(c.node_count(), 0);
        assert!(c.all_replicas(&key(0)).is_empty());
    }

    #[test]
    fn concurrent_adds_and_removal_stay_consistent() {
        let c = Arc::new(cluster(8));
        let mut handles = Vec::new();
        for p in 1..=8u16 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for seq in 0..200 {
                    let _ = c.add_replica(&key(seq), addr(p));
                }
            }));
        }
        let remover = {
            let c = c.clone();
            std::thread::spawn(move || {
                let _ = c.remove_node(addr(8));
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        remover.join().unwrap();

        for seq in 0..200 {
            let set = c.all_replicas(&key(seq));
            assert!(!set.contains(&addr(8)));
            for p in 1..=7 {
                assert!(set.contains(&addr(p)));
            }
        }
    }
}
