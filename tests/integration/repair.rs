use crate::*;

use ridge_ctl::ClientError;

// ══════════════════════════════════════════════════════════════════════════════
//  Read-path repair of corrupted replicas
// ══════════════════════════════════════════════════════════════════════════════

async fn replicated_file(
    tc: &TestCluster,
    name: &str,
    len: usize,
    factor: usize,
) -> (ChunkKey, Vec<u8>) {
    let client = tc.client().await.unwrap();
    let path = tc.scratch(name);
    let data = write_sample(&path, len);
    client.write_file(&path).await.unwrap();
    let key = ChunkKey::new(name, 0);
    assert!(tc.await_replicas(&key, factor).await, "{key} not replicated");
    (key, data)
}

/// A server whose copy has a bad slice fetches that slice from another
/// replica, answers the read with the repaired chunk, and keeps the
/// repaired copy on disk.
#[tokio::test]
async fn test_corrupt_slice_is_repaired_on_read() {
    let tc = TestCluster::start(2, test_config(2)).await.unwrap();
    let (key, data) = replicated_file(&tc, "doc.bin", 30 * 1024, 2).await;

    let victim = &tc.servers[0];
    corrupt_slice(&victim.store(), &key, 1);
    let on_disk = victim.store().get(&key).unwrap().unwrap();
    assert!(Chunk::decode(&on_disk).is_err());

    let client = tc.client().await.unwrap();
    let chunk = client.fetch_chunk(&key, victim.addr).await.unwrap();
    assert_eq!(chunk.data(), data);

    let on_disk = victim.store().get(&key).unwrap().unwrap();
    assert_eq!(Chunk::decode(&on_disk).unwrap().data(), data);
}

/// Several bad slices on one server are all recovered in one repair.
#[tokio::test]
async fn test_multiple_corrupt_slices_are_repaired() {
    let tc = TestCluster::start(3, test_config(3)).await.unwrap();
    let (key, data) = replicated_file(&tc, "multi.bin", 40 * 1024, 3).await;

    let victim = &tc.servers[1];
    for slice in [0, 2, 4] {
        corrupt_slice(&victim.store(), &key, slice);
    }

    let client = tc.client().await.unwrap();
    let chunk = client.fetch_chunk(&key, victim.addr).await.unwrap();
    assert_eq!(chunk.data(), data);
}

/// A replica that cannot supply every requested slice answers with
/// nothing; the repair moves on to the next one.
#[tokio::test]
async fn test_repair_skips_replicas_that_cannot_help() {
    let tc = TestCluster::start(3, test_config(3)).await.unwrap();
    let (key, data) = replicated_file(&tc, "spread.bin", 24 * 1024, 3).await;

    corrupt_slice(&tc.servers[0].store(), &key, 1);
    corrupt_slice(&tc.servers[1].store(), &key, 1);

    let client = tc.client().await.unwrap();
    let chunk = client.fetch_chunk(&key, tc.servers[0].addr).await.unwrap();
    assert_eq!(chunk.data(), data);

    // Server 1 was never read, so its copy is still bad.
    let other = tc.servers[1].store().get(&key).unwrap().unwrap();
    assert!(Chunk::decode(&other).is_err());
}

/// Every replica carries the same bad slice: the reader gets ReadFailed
/// naming the slice instead of corrupt data.
#[tokio::test]
async fn test_corruption_on_every_replica_fails_the_read() {
    let tc = TestCluster::start(2, test_config(2)).await.unwrap();
    let (key, _) = replicated_file(&tc, "doomed.bin", 16 * 1024, 2).await;

    for s in &tc.servers {
        corrupt_slice(&s.store(), &key, 1);
    }

    let client = tc.client().await.unwrap();
    match client.fetch_chunk(&key, tc.servers[0].addr).await {
        Err(ClientError::ReadFailed { key: k, reason }) => {
            assert_eq!(k, key);
            assert!(reason.contains("[1]"), "{reason}");
        }
        other => panic!("expected ReadFailed, got {other:?}"),
    }
}
