//! Shared setup for the integration tests

#![allow(dead_code)]

use appscale_coord::cluster::NodeRoleModel;
use appscale_coord::common::ClientConfig;
use appscale_coord::{CoordinationClient, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

pub const KEYNAME: &str = "appscale";

/// Client settings with millisecond delays so retries don't slow tests down.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        store_addresses: vec!["memory:2181".to_string()],
        retry_delay_ms: 1,
        max_retry_delay_ms: 1,
        write_retry_delay_ms: 1,
        lock_retry_delay_ms: 2,
        ..ClientConfig::default()
    }
}

pub async fn connected_client(store: &MemoryStore, owner: &str) -> Arc<CoordinationClient> {
    let config = fast_config();
    let addresses = config.store_addresses.clone();
    let client = CoordinationClient::new(Arc::new(store.clone()), config);
    client.connect_any(owner, &addresses).await.unwrap();
    Arc::new(client)
}

pub fn node(private_ip: &str, roles: &[&str]) -> NodeRoleModel {
    NodeRoleModel::new(
        format!("203.0.113.{}", private_ip.rsplit('.').next().unwrap_or("1")),
        private_ip,
        roles,
        "ec2",
        KEYNAME,
    )
}

/// Poll `check` until it returns true or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
