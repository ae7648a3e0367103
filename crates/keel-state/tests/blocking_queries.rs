//! Blocking query tests.
//!
//! Validates that a read's watch set wakes on writes that affect its result,
//! stays asleep for unrelated writes, and wakes when the store is abandoned.

use std::time::Duration;

use keel_state::*;

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

fn test_node(name: &str) -> Node {
    Node {
        node: name.to_string(),
        address: "10.0.0.1".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn kv_get_blocks_until_key_changes() {
    let store = test_store();
    store.kvs_set(1, &DirEntry::new("config/a", "1")).unwrap();

    let mut ws = WatchSet::new();
    let (idx, _) = store.kvs_get(Some(&mut ws), "config/a").unwrap();
    assert_eq!(idx, 1);

    let writer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.kvs_set(2, &DirEntry::new("config/b", "x")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.kvs_set(3, &DirEntry::new("config/a", "2")).unwrap();
    });

    let timed_out = ws.watch(Duration::from_secs(5)).await;
    assert!(!timed_out);
    let (idx, entry) = store.kvs_get(None, "config/a").unwrap();
    assert_eq!(idx, 3);
    assert_eq!(entry.unwrap().value, b"2");
}

#[tokio::test]
async fn unrelated_write_does_not_wake() {
    let store = test_store();
    let mut ws = WatchSet::new();
    store.kvs_list(Some(&mut ws), "app/").unwrap();

    store.kvs_set(1, &DirEntry::new("other/x", "")).unwrap();
    store.ensure_node(2, &test_node("n1")).unwrap();

    assert!(ws.watch(Duration::from_millis(30)).await);
}

#[tokio::test]
async fn prefix_list_wakes_on_delete() {
    let store = test_store();
    store.kvs_set(1, &DirEntry::new("app/x", "")).unwrap();
    let mut ws = WatchSet::new();
    let (idx, _) = store.kvs_list(Some(&mut ws), "app/").unwrap();
    assert_eq!(idx, 1);

    store.kvs_delete(2, "app/x").unwrap();
    assert!(!ws.watch(Duration::from_secs(5)).await);
    let (idx, entries) = store.kvs_list(None, "app/").unwrap();
    assert_eq!(idx, 2);
    assert!(entries.is_empty());
}

#[tokio::test]
async fn health_query_wakes_on_check_update() {
    let store = test_store();
    store.ensure_node(1, &test_node("n1")).unwrap();
    store
        .ensure_service(2, "n1", &NodeService {
            id: "web".into(),
            service: "web".into(),
            port: 80,
            ..Default::default()
        })
        .unwrap();

    let mut ws = WatchSet::new();
    let (idx, results) = store.check_service_nodes(Some(&mut ws), "web").unwrap();
    assert_eq!(idx, 2);
    assert!(results.unwrap()[0].checks.is_empty());

    let writer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer
            .ensure_check(3, &HealthCheck {
                node: "n1".into(),
                check_id: "web-alive".into(),
                service_id: "web".into(),
                status: HealthStatus::Passing,
                ..Default::default()
            })
            .unwrap();
    });

    assert!(!ws.watch(Duration::from_secs(5)).await);
    let (idx, results) = store.check_service_nodes(None, "web").unwrap();
    assert_eq!(idx, 3);
    assert_eq!(results.unwrap()[0].checks.len(), 1);
}

#[tokio::test]
async fn abandon_wakes_blocking_queries() {
    let store = test_store();
    let mut ws = WatchSet::new();
    store.nodes(Some(&mut ws)).unwrap();
    store.watch_abandon(&mut ws);

    let old = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        old.abandon();
    });

    assert!(!ws.watch(Duration::from_secs(5)).await);
    assert!(store.is_abandoned());
}

#[tokio::test]
async fn empty_watch_set_waits_out_the_timeout() {
    let mut ws = WatchSet::new();
    assert!(ws.is_empty());
    assert!(ws.watch(Duration::from_millis(10)).await);
}
