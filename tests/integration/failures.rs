use crate::*;

use ridge_ctl::ClientError;

// ══════════════════════════════════════════════════════════════════════════════
//  Server loss, re-replication, and rejected requests
// ══════════════════════════════════════════════════════════════════════════════

/// Fewer live servers than the replication factor: the write is refused
/// with both numbers, and nothing is stored.
#[tokio::test]
async fn test_insufficient_servers_rejects_write() {
    let tc = TestCluster::start(1, test_config(3)).await.unwrap();
    let client = tc.client().await.unwrap();
    let path = tc.scratch("big.bin");
    write_sample(&path, 4096);

    match client.write_file(&path).await {
        Err(ClientError::NoTargets { needed, available }) => {
            assert_eq!(needed, 3);
            assert_eq!(available, 1);
        }
        other => panic!("expected NoTargets, got {other:?}"),
    }
    assert_eq!(tc.servers[0].store().count(), 0);
}

/// A chunk nobody wrote has no replica.
#[tokio::test]
async fn test_unknown_chunk_has_no_replica() {
    let tc = TestCluster::start(2, test_config(2)).await.unwrap();
    let client = tc.client().await.unwrap();
    assert!(matches!(
        client.locate(&ChunkKey::new("never-written", 0)).await,
        Err(ClientError::NoReplica(_))
    ));
}

/// A server that stops answering probes is dropped from the cluster, and
/// the controller has a survivor copy each of its chunks to a spare server.
#[tokio::test]
async fn test_dead_server_chunks_are_rereplicated() {
    let mut tc = TestCluster::start(4, test_config(2)).await.unwrap();
    let client = tc.client().await.unwrap();
    let path = tc.scratch("precious.bin");
    let data = write_sample(&path, 20 * 1024);
    client.write_file(&path).await.unwrap();

    let key = ChunkKey::new("precious.bin", 0);
    assert!(tc.await_replicas(&key, 2).await);
    let before = tc.cluster.all_replicas(&key);
    let victim = *before.iter().next().unwrap();

    tc.kill(victim).await.unwrap();
    assert!(
        wait_until(SETTLE, || !tc.cluster.has_node(victim)).await,
        "dead server never removed"
    );

    let restored = wait_until(SETTLE, || {
        let now = tc.cluster.all_replicas(&key);
        now.len() == 2 && !now.contains(&victim)
    })
    .await;
    assert!(restored, "replication factor not restored: {:?}", tc.cluster.all_replicas(&key));

    // The new replica is a real, verifying copy.
    let fresh = tc
        .cluster
        .all_replicas(&key)
        .into_iter()
        .find(|a| !before.contains(a))
        .unwrap();
    let chunk = client.fetch_chunk(&key, fresh).await.unwrap();
    assert_eq!(chunk.data(), data);
}

/// When the only holder of a chunk dies the chunk is gone: the controller
/// knows no replica and reads fail cleanly.
#[tokio::test]
async fn test_losing_every_replica_leaves_no_replica() {
    let mut tc = TestCluster::start(2, test_config(1)).await.unwrap();
    let client = tc.client().await.unwrap();
    let path = tc.scratch("fragile.bin");
    write_sample(&path, 100);
    client.write_file(&path).await.unwrap();

    let key = ChunkKey::new("fragile.bin", 0);
    assert!(tc.await_replicas(&key, 1).await);
    let holder = tc.cluster.existing_replica(&key).unwrap();

    tc.kill(holder).await.unwrap();
    assert!(wait_until(SETTLE, || !tc.cluster.has_node(holder)).await);

    assert!(matches!(
        client.locate(&key).await,
        Err(ClientError::NoReplica(_))
    ));
    assert_eq!(tc.cluster.node_count(), 1);
}

/// Asking a server for a chunk it does not hold yields ReadFailed rather
/// than silence.
#[tokio::test]
async fn test_read_from_wrong_server_fails() {
    let tc = TestCluster::start(1, test_config(1)).await.unwrap();
    let client = tc.client().await.unwrap();
    let key = ChunkKey::new("elsewhere", 0);
    match client.fetch_chunk(&key, tc.servers[0].addr).await {
        Err(ClientError::ReadFailed { key: k, .. }) => assert_eq!(k, key),
        other => panic!("expected ReadFailed, got {other:?}"),
    }
}
