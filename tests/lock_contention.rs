//! Several controllers racing for the cluster lock

mod common;

use appscale_coord::{ClusterLock, MemoryStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_holder() {
    let store = MemoryStore::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 1..=5 {
        let owner = format!("10.0.0.{}", i);
        let client = common::connected_client(&store, &owner).await;
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        let completed = completed.clone();

        handles.push(tokio::spawn(async move {
            let lock = ClusterLock::new(client);
            for _ in 0..3 {
                lock.run_exclusive(&owner, || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 15);
}

#[tokio::test]
async fn test_crashed_holder_frees_lock() {
    let store = MemoryStore::new();
    let crashed = common::connected_client(&store, "10.0.0.1").await;
    let survivor = common::connected_client(&store, "10.0.0.2").await;

    let held = ClusterLock::new(crashed.clone());
    assert!(held.try_acquire("10.0.0.1").await.unwrap());

    let waiting = ClusterLock::new(survivor);
    assert!(!waiting.try_acquire("10.0.0.2").await.unwrap());

    store.expire_session(crashed.session_id().await.unwrap());

    let owner = waiting
        .run_exclusive("10.0.0.2", || async { waiting.current_owner().await })
        .await
        .unwrap();
    assert_eq!(owner.as_deref(), Some("10.0.0.2"));
}
