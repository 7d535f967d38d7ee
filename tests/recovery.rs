//! Controller state recovery after losing the coordination store

mod common;

use appscale_coord::{ClusterLock, Error, MemoryStore, StateSnapshots};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct DeploymentState {
    nodes: Vec<String>,
    last_updated: u64,
}

#[tokio::test]
async fn test_state_survives_store_rebuild() {
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("appscale").join("controller_state.json");
    let state = DeploymentState {
        nodes: vec!["10.0.0.1".into(), "10.0.0.2".into()],
        last_updated: 1_700_000_000,
    };

    // Write through the first store
    {
        let store = MemoryStore::new();
        let client = common::connected_client(&store, "10.0.0.1").await;
        let snapshots = StateSnapshots::new(client.clone(), ClusterLock::new(client), &local);
        snapshots.write("10.0.0.1", &state).await.unwrap();
    }

    // Store rebuilt from scratch; the local copy carries the state
    {
        let store = MemoryStore::new();
        let client = common::connected_client(&store, "10.0.0.1").await;
        let snapshots = StateSnapshots::new(client.clone(), ClusterLock::new(client), &local);
        let recovered: DeploymentState = snapshots.read().await.unwrap();
        assert_eq!(recovered, state);
    }
}

#[tokio::test]
async fn test_store_copy_wins_over_local() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();

    let writer_client = common::connected_client(&store, "10.0.0.1").await;
    let writer = StateSnapshots::new(
        writer_client.clone(),
        ClusterLock::new(writer_client),
        dir.path().join("writer.json"),
    );
    let reader_client = common::connected_client(&store, "10.0.0.2").await;
    let reader = StateSnapshots::new(
        reader_client.clone(),
        ClusterLock::new(reader_client),
        dir.path().join("reader.json"),
    );

    let first = DeploymentState {
        nodes: vec!["10.0.0.1".into()],
        last_updated: 1,
    };
    let second = DeploymentState {
        nodes: vec!["10.0.0.1".into(), "10.0.0.2".into()],
        last_updated: 2,
    };
    reader.write("10.0.0.2", &first).await.unwrap();
    writer.write("10.0.0.1", &second).await.unwrap();

    let seen: DeploymentState = reader.read().await.unwrap();
    assert_eq!(seen, second);
}

#[tokio::test]
async fn test_nothing_to_recover() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let client = common::connected_client(&store, "10.0.0.1").await;
    let snapshots = StateSnapshots::new(
        client.clone(),
        ClusterLock::new(client),
        dir.path().join("never_written.json"),
    );

    let result: appscale_coord::Result<DeploymentState> = snapshots.read().await;
    assert!(matches!(result, Err(Error::StateNotFound)));
}
