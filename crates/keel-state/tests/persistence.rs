//! Persistence tests: file-backed stores, snapshot round trips across
//! stores, and tombstone GC driving reaps.

use std::time::Duration;

use keel_state::*;

fn fill(store: &StateStore) {
    store
        .ensure_registration(1, &RegisterRequest {
            node: "n1".into(),
            address: "10.0.0.1".into(),
            node_meta: [("zone".to_string(), "a".to_string())].into(),
            service: Some(NodeService {
                id: "api".into(),
                service: "api".into(),
                tags: vec!["v2".into()],
                port: 8080,
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
    for (i, key) in ["cfg/a", "cfg/b", "cfg/c"].iter().enumerate() {
        store.kvs_set(2 + i as u64, &DirEntry::new(*key, "v")).unwrap();
    }
    store.kvs_delete(5, "cfg/b").unwrap();
}

#[test]
fn snapshot_from_disk_restores_into_fresh_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = StateStore::open(&dir.path().join("source.redb")).unwrap();
    fill(&source);

    let data = source.snapshot().unwrap().dump().unwrap();
    let json = serde_json::to_vec_pretty(&data).unwrap();
    let parsed: SnapshotData = serde_json::from_slice(&json).unwrap();

    let target_path = dir.path().join("target.redb");
    {
        let target = StateStore::open(&target_path).unwrap();
        target.restore_snapshot(&parsed).unwrap();
    }

    let reopened = StateStore::open(&target_path).unwrap();
    assert_eq!(reopened.last_index().unwrap(), 5);
    assert_eq!(reopened.snapshot().unwrap().dump().unwrap(), data);

    let (idx, entries) = reopened.kvs_list(None, "cfg/").unwrap();
    assert_eq!(idx, 5);
    assert_eq!(entries.len(), 2);

    let mut filters = Meta::new();
    filters.insert("zone".into(), "a".into());
    let (_, services) = reopened.services_by_node_meta(None, &filters).unwrap();
    assert_eq!(services["api"], vec!["v2"]);
}

#[test]
fn tombstone_survives_partial_reap() {
    let store = StateStore::open_in_memory().unwrap();
    fill(&store);

    store.reap_tombstones(4).unwrap();
    assert_eq!(store.kvs_list(None, "cfg/b").unwrap().0, 5);

    store.reap_tombstones(5).unwrap();
    let (idx, entries) = store.kvs_list(None, "cfg/b").unwrap();
    assert!(entries.is_empty());
    assert_eq!(idx, store.max_index(&[tables::KVS, tables::TOMBSTONES]).unwrap());
}

#[tokio::test]
async fn gc_expirations_drive_reaps() {
    let (gc, mut expired) = TombstoneGc::new(Duration::from_millis(20), Duration::from_millis(10));
    let store = StateStore::open_in_memory().unwrap().with_tombstone_gc(gc.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let gc_task = tokio::spawn(gc.clone().run(shutdown_rx));

    store.kvs_set(1, &DirEntry::new("tmp/x", "")).unwrap();
    store.kvs_delete(2, "tmp/x").unwrap();
    assert!(gc.pending_expiration());

    let index = tokio::time::timeout(Duration::from_secs(5), expired.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index, 2);
    assert_eq!(store.reap_tombstones(index).unwrap(), 1);
    assert!(store.snapshot().unwrap().tombstones().unwrap().is_empty());

    shutdown_tx.send(true).unwrap();
    gc_task.await.unwrap();
}

#[test]
fn aborted_write_leaves_no_trace() {
    let store = StateStore::open_in_memory().unwrap();
    fill(&store);
    let before = store.snapshot().unwrap().dump().unwrap();

    // A check for an unknown service fails the whole registration.
    let err = store
        .ensure_registration(9, &RegisterRequest {
            node: "n1".into(),
            address: "10.9.9.9".into(),
            checks: vec![HealthCheck {
                check_id: "c".into(),
                service_id: "nope".into(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, StateError::MissingService));
    assert!(err.is_precondition());

    assert_eq!(store.snapshot().unwrap().dump().unwrap(), before);
}
