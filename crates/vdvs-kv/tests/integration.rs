//! Metadata operations seen from several hosts sharing one cluster.

mod common;

use std::time::Duration;

use common::Cluster;
use vdvs_kv::{Op, WatchKind, PREFIX_GREF, PREFIX_STATE};

#[tokio::test(start_paused = true)]
async fn test_concurrent_increments_all_land() {
    let cluster = Cluster::new();
    cluster
        .host()
        .write_batch(&[("gref/v".to_string(), "0".to_string())])
        .await
        .unwrap();

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let store = cluster.host();
            tokio::spawn(async move { store.atomic_incr("gref/v").await })
        })
        .collect();
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(cluster.kv.get("gref/v").as_deref(), Some("5"));
}

#[tokio::test(start_paused = true)]
async fn test_waiter_sees_state_set_by_other_host() {
    let cluster = Cluster::new();
    let a = cluster.host();
    let b = cluster.host();
    a.write_batch(&[
        ("state/v".to_string(), "Mounting".to_string()),
        ("info/v".to_string(), "{}".to_string()),
    ])
    .await
    .unwrap();

    let waiter = tokio::spawn(async move { b.blocking_wait_and_get("state/v", "Mounted", "info/v").await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    a.update_batch(vec![
        Op::put("info/v", r#"{"port":30000}"#),
        Op::put("state/v", "Mounted"),
    ])
    .await
    .unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), r#"{"port":30000}"#);
}

#[tokio::test(start_paused = true)]
async fn test_lock_serializes_hosts() {
    let cluster = Cluster::new();
    let mut first = cluster.host().create_lock("gref/v");
    first.blocking_lock_with_lease().await.unwrap();

    let second = {
        let store = cluster.host();
        tokio::spawn(async move {
            let mut lock = store.create_lock("gref/v");
            lock.blocking_lock_with_lease().await?;
            lock.release().await;
            Ok::<_, vdvs_core::VdvsError>(tokio::time::Instant::now())
        })
    };
    let held_until = tokio::time::Instant::now() + Duration::from_secs(4);
    tokio::time::sleep_until(held_until).await;
    first.release().await;
    let acquired_at = second.await.unwrap().unwrap();
    assert!(acquired_at >= held_until);
    assert!(!cluster.kv.is_locked("gref/v-lock"));
}

#[tokio::test]
async fn test_watch_reports_previous_values() {
    let cluster = Cluster::new();
    let store = cluster.host();
    let mut events = store.backend().watch_prefix(PREFIX_GREF).await.unwrap();

    store
        .write_batch(&[
            ("gref/v".to_string(), "0".to_string()),
            ("state/v".to_string(), "Ready".to_string()),
        ])
        .await
        .unwrap();
    store.compare_and_put("gref/v", "0", "1").await;
    store.delete_keys_for("v").await.unwrap();

    let created = events.recv().await.unwrap();
    assert_eq!((created.kind, created.prev_value), (WatchKind::Put, None));
    let bumped = events.recv().await.unwrap();
    assert_eq!(bumped.value.as_deref(), Some("1"));
    assert_eq!(bumped.prev_value.as_deref(), Some("0"));
    let deleted = events.recv().await.unwrap();
    assert_eq!(deleted.kind, WatchKind::Delete);
    assert!(events.try_recv().is_err());
    assert!(store.list(PREFIX_STATE).await.unwrap().is_empty());
}
