use crate::*;

use ridge_core::Metadata;

// ══════════════════════════════════════════════════════════════════════════════
//  Write / read through a healthy cluster
// ══════════════════════════════════════════════════════════════════════════════

/// A 70 KiB file becomes two chunks (64 KiB + 6 KiB), each stored on every
/// server, and reads back byte for byte.
#[tokio::test]
async fn test_write_then_read_round_trip() {
    let tc = TestCluster::start(3, test_config(3)).await.unwrap();
    let client = tc.client().await.unwrap();

    let path = tc.scratch("report.bin");
    let data = write_sample(&path, 70 * 1024);

    let chunks = client.write_file(&path).await.unwrap();
    assert_eq!(chunks, 2);

    for seq in 0..2 {
        let key = ChunkKey::new("report.bin", seq);
        assert!(
            tc.await_replicas(&key, 3).await,
            "{key} never reached 3 replicas: {:?}",
            tc.cluster.all_replicas(&key)
        );
    }

    let out_dir = tc.scratch("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    let out = client.read_file("report.bin", &out_dir).await.unwrap();
    assert_eq!(std::fs::read(out).unwrap(), data);
}

/// The write pipeline puts the chunk on every target the controller chose,
/// not just the first.
#[tokio::test]
async fn test_pipeline_reaches_every_target() {
    let tc = TestCluster::start(4, test_config(3)).await.unwrap();
    let client = tc.client().await.unwrap();

    let meta = Metadata::new("piped", 0).unwrap();
    let slices = vec![ridge_core::Slice::new(b"pipeline!", 16).unwrap()];
    let chunk = Chunk::new(meta, slices, 16, true, ridge_core::HashKind::Blake3).unwrap();

    let targets = client.request_write_targets(&chunk.key()).await.unwrap();
    assert_eq!(targets.len(), 3);
    client.store_chunk(&chunk, &targets).await.unwrap();

    let stored_everywhere = wait_until(SETTLE, || {
        targets
            .iter()
            .all(|t| tc.server(*t).is_some_and(|s| s.store().has(&chunk.key())))
    })
    .await;
    assert!(stored_everywhere, "chunk missing from a pipeline target");

    // The one server left out never sees it.
    let outsider = tc
        .servers
        .iter()
        .find(|s| !targets.contains(&s.addr))
        .unwrap();
    assert!(!outsider.store().has(&chunk.key()));
}

/// Overwriting a file sends the new chunk to every existing holder, and a
/// later read returns the new content.
#[tokio::test]
async fn test_overwrite_replaces_every_replica() {
    let tc = TestCluster::start(3, test_config(2)).await.unwrap();
    let client = tc.client().await.unwrap();
    let path = tc.scratch("notes.txt");
    let key = ChunkKey::new("notes.txt", 0);

    std::fs::write(&path, b"first draft").unwrap();
    client.write_file(&path).await.unwrap();
    assert!(tc.await_replicas(&key, 2).await);
    let holders = tc.cluster.all_replicas(&key);

    std::fs::write(&path, b"second draft, longer").unwrap();
    let targets = client.request_write_targets(&key).await.unwrap();
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| holders.contains(t)));
    client.write_file(&path).await.unwrap();

    let all_updated = wait_until(SETTLE, || {
        holders.iter().all(|h| {
            tc.server(*h)
                .and_then(|s| s.store().get(&key).ok().flatten())
                .and_then(|b| Chunk::decode(&b).ok())
                .is_some_and(|c| c.data() == b"second draft, longer")
        })
    })
    .await;
    assert!(all_updated, "a holder kept the old content");

    let out_dir = tc.scratch("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    let out = client.read_file("notes.txt", &out_dir).await.unwrap();
    assert_eq!(std::fs::read(out).unwrap(), b"second draft, longer");
}

/// A server restarted on the same storage directory reports what it holds
/// in its first heartbeat, under its new address.
#[tokio::test]
async fn test_restarted_server_reports_stored_chunks() {
    let mut tc = TestCluster::start(1, test_config(1)).await.unwrap();
    let client = tc.client().await.unwrap();
    let path = tc.scratch("keep.bin");
    write_sample(&path, 1000);
    client.write_file(&path).await.unwrap();

    let key = ChunkKey::new("keep.bin", 0);
    assert!(tc.await_replicas(&key, 1).await);

    let old = tc.servers[0].addr;
    let storage = tc.kill(old).await.unwrap();
    assert!(wait_until(SETTLE, || !tc.cluster.has_node(old)).await);
    assert!(tc.cluster.all_replicas(&key).is_empty());

    let new = tc.spawn_server(storage).await.unwrap();
    assert!(tc.await_replicas(&key, 1).await);
    assert!(tc.cluster.all_replicas(&key).contains(&new));
    assert_ne!(tc.controller, new);
}
