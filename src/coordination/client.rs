//! Coordination client
//!
//! Owns one session to the coordination store and wraps every primitive in
//! the recovery policy controllers rely on:
//! - session loss: reconnect, recreate this node's liveness entry, retry once
//! - transient errors: sleep and retry (unbounded unless configured)
//! - writes: up to `write_attempts` tries, then logged and abandoned
//!
//! The session handle sits behind an async `RwLock`. Operations clone the
//! handle under the read lock and run without holding it; reconnecting
//! replaces it under the write lock.

use crate::common::config::store_address;
use crate::common::{retry_delay_for, ClientConfig, Error, Result};
use crate::coordination::paths;
use crate::store::{
    parent_path, CoordinationStore, SessionId, Stat, StoreError, StoreResult, StoreSession,
};
use futures_util::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

struct Connection {
    session: Arc<dyn StoreSession>,
    address: String,
    owner: String,
    session_timeout: Duration,
}

/// Result of a write that survived the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write landed; `version` is the node's version afterwards.
    Applied { version: i32 },
    /// Every attempt failed and the update was dropped.
    Abandoned,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }
}

/// Durable handle to the coordination store
pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    config: ClientConfig,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl CoordinationClient {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ClientConfig) -> Self {
        Self {
            store,
            config,
            connection: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a session to `address` on behalf of `owner`, replacing any previous one.
    ///
    /// Blocks until the store accepts a session, or until `connect_attempts`
    /// runs out when configured.
    pub async fn connect(&self, owner: &str, address: &str, session_timeout: Duration) -> Result<()> {
        let mut guard = self.connection.write().await;
        if let Some(old) = guard.take() {
            tracing::debug!(address = %old.address, "Closing previous coordination session");
            old.session.close().await;
        }

        tracing::debug!("Waiting for {} to accept a session", address);
        let session = self.open_session(address, session_timeout).await?;
        tracing::info!(
            owner,
            address,
            session = session.session_id(),
            "Connected to coordination store"
        );

        *guard = Some(Arc::new(Connection {
            session,
            address: address.to_string(),
            owner: owner.to_string(),
            session_timeout,
        }));
        Ok(())
    }

    /// Connect to a randomly chosen store from `addresses`, trying again until one answers.
    pub async fn connect_any(&self, owner: &str, addresses: &[String]) -> Result<()> {
        if addresses.is_empty() {
            return Err(Error::InvalidConfiguration(
                "no coordination store addresses configured".into(),
            ));
        }

        loop {
            let index = rand::thread_rng().gen_range(0..addresses.len());
            let address = store_address(&addresses[index]);
            tracing::info!("Trying to use coordination store at {}", address);

            match self
                .connect(owner, &address, self.config.session_timeout())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(address = %address, error = %e, "Coordination store unreachable");
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|conn| conn.session.session_id())
    }

    pub async fn owner(&self) -> Option<String> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|conn| conn.owner.clone())
    }

    /// Close the session; ephemeral entries it owns disappear.
    pub async fn close(&self) {
        if let Some(conn) = self.connection.write().await.take() {
            conn.session.close().await;
        }
    }

    async fn open_session(
        &self,
        address: &str,
        session_timeout: Duration,
    ) -> Result<Arc<dyn StoreSession>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.open_session(address, session_timeout).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_transient() || e.is_session_loss() => {
                    if self.config.connect_attempts.is_some_and(|max| attempt >= max) {
                        return Err(Error::ConnectionLost(format!(
                            "{} did not accept a session after {} attempts: {}",
                            address, attempt, e
                        )));
                    }
                    tracing::debug!(address, attempt, error = %e, "Coordination store not reachable yet");
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => return Err(Error::from_store("connect", address, e)),
            }
        }
    }

    async fn current(&self) -> Result<Arc<Connection>> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Replace the session identified by `stale`. Callers racing on the same
    /// loss find it already replaced and return immediately.
    async fn reconnect(&self, stale: SessionId) -> Result<()> {
        let mut guard = self.connection.write().await;
        let current = guard.clone().ok_or(Error::NotInitialized)?;
        if current.session.session_id() != stale {
            return Ok(());
        }

        current.session.close().await;
        let session = self
            .open_session(&current.address, current.session_timeout)
            .await?;
        restore_liveness(session.as_ref(), &current.owner).await;

        *guard = Some(Arc::new(Connection {
            session,
            address: current.address.clone(),
            owner: current.owner.clone(),
            session_timeout: current.session_timeout,
        }));
        Ok(())
    }

    /// Run one store primitive under the recovery policy.
    pub(crate) async fn run_operation<T, F, Fut>(&self, op: &'static str, path: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn StoreSession>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut reconnected = false;
        let mut attempt = 0u32;

        loop {
            let conn = self.current().await?;
            let session_id = conn.session.session_id();

            match f(conn.session.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_session_loss() => {
                    if reconnected {
                        return Err(Error::ConnectionLost(format!(
                            "{} on {} after reconnecting: {}",
                            op, path, e
                        )));
                    }
                    tracing::warn!(op, path, error = %e, "Lost our coordination session - making a new connection and trying again");
                    self.reconnect(session_id).await?;
                    reconnected = true;
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if self
                        .config
                        .max_operation_attempts
                        .is_some_and(|max| attempt >= max)
                    {
                        return Err(Error::ConnectionLost(format!(
                            "{} on {} failed after {} attempts: {}",
                            op, path, attempt, e
                        )));
                    }
                    tracing::warn!(op, path, attempt, error = %e, "Saw a transient coordination store error - trying again");
                    let delay = retry_delay_for(
                        attempt,
                        self.config.retry_delay(),
                        self.config.max_retry_delay(),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(Error::from_store(op, path, e)),
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.get_versioned(path).await?.0)
    }

    /// Data and version of `path`; `NotFound` if it does not exist.
    pub async fn get_versioned(&self, path: &str) -> Result<(Vec<u8>, i32)> {
        let (data, stat) = self.get_with_stat(path).await?;
        Ok((data, stat.version))
    }

    /// Data and full metadata of `path`, including the owning session of an
    /// ephemeral node.
    pub async fn get_with_stat(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.run_operation("get", path, |s| async move { s.get(path).await })
            .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.run_operation("exists", path, |s| async move {
            match s.get(path).await {
                Ok(_) => Ok(true),
                Err(StoreError::NoNode(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Child names of `path`; empty when `path` does not exist.
    pub async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.run_operation("get_children", path, |s| async move {
            match s.get_children(path).await {
                Err(StoreError::NoNode(_)) => Ok(Vec::new()),
                other => other,
            }
        })
        .await
    }

    /// Unconditional create; fails if the path is already taken.
    pub async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<()> {
        self.run_operation("create", path, |s| async move {
            s.create(path, data, ephemeral).await
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.run_operation("delete", path, |s| async move { s.delete(path).await })
            .await
    }

    /// Create or update `path`.
    ///
    /// An existing node is updated (compare-and-swap when `expected_version`
    /// is given). A missing node is created, unless a version was expected,
    /// which means it was deleted since it was read and fails immediately.
    /// Version conflicts also fail immediately. Anything else is retried
    /// `write_attempts` times and then abandoned with an error log.
    pub async fn set(
        &self,
        path: &str,
        value: &[u8],
        ephemeral: bool,
        expected_version: Option<i32>,
    ) -> Result<WriteOutcome> {
        let attempts = self.config.write_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_set(path, value, ephemeral, expected_version).await {
                Ok(version) => return Ok(WriteOutcome::Applied { version }),
                Err(e) if !write_is_retryable(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(path, attempt, error = %e, "Saw a failure trying to write to the coordination store");
                    if attempt < attempts {
                        tracing::warn!(path, retries_left = attempts - attempt, "Retrying write operation");
                        tokio::time::sleep(self.config.write_retry_delay()).await;
                    }
                }
            }
        }

        tracing::error!(path, attempts, "Failed to write to the coordination store and no retries left - skipping this write");
        Ok(WriteOutcome::Abandoned)
    }

    async fn try_set(
        &self,
        path: &str,
        value: &[u8],
        ephemeral: bool,
        expected_version: Option<i32>,
    ) -> Result<i32> {
        if self.exists(path).await? {
            let stat = self
                .run_operation("set", path, |s| async move {
                    s.set(path, value, expected_version).await
                })
                .await?;
            return Ok(stat.version);
        }

        if expected_version.is_some() {
            return Err(Error::OperationFailed {
                op: "set",
                path: path.to_string(),
                source: StoreError::NoNode(path.to_string()),
            });
        }

        self.create(path, value, ephemeral).await?;
        Ok(0)
    }

    /// Create `path` and every missing ancestor as persistent dummy nodes.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            if p == "/" || self.exists(p).await? {
                break;
            }
            missing.push(p);
            current = parent_path(p);
        }

        for p in missing.into_iter().rev() {
            match self.create(p, paths::DUMMY_DATA, false).await {
                Ok(()) => {}
                Err(e) if e.is_node_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete `path` and everything below it.
    ///
    /// Individual failures are logged and skipped so one stuck entry does not
    /// abort the teardown; only `NotInitialized` is returned.
    pub async fn delete_recursive(&self, path: &str) -> Result<()> {
        let failures = self.delete_tree(path).await?;
        if failures > 0 {
            tracing::warn!(path, failures, "Recursive delete left entries behind");
        }
        Ok(())
    }

    fn delete_tree<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut failures = 0;

            match self.children(path).await {
                Ok(children) => {
                    for child in children {
                        let child_path = format!("{}/{}", path, child);
                        failures += self.delete_tree(&child_path).await?;
                    }
                }
                Err(Error::NotInitialized) => return Err(Error::NotInitialized),
                Err(e) => {
                    tracing::error!(path, error = %e, "Failed to list children - continuing onward");
                    failures += 1;
                }
            }

            match self.delete(path).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(Error::NotInitialized) => return Err(Error::NotInitialized),
                Err(e) => {
                    tracing::error!(path, error = %e, "Failed to delete key - continuing onward");
                    failures += 1;
                }
            }

            Ok(failures)
        })
    }
}

fn write_is_retryable(err: &Error) -> bool {
    match err {
        Error::NotInitialized => false,
        Error::OperationFailed { source, .. } => !matches!(
            source,
            StoreError::BadVersion { .. } | StoreError::BadArguments(_) | StoreError::NoNode(_)
        ),
        _ => true,
    }
}

/// Recreate `owner`'s liveness entry on a fresh session.
async fn restore_liveness(session: &dyn StoreSession, owner: &str) {
    let path = paths::live_path(owner);
    match session.create(&path, paths::DUMMY_DATA, true).await {
        Ok(()) => tracing::info!(owner, "Recreated liveness entry after reconnecting"),
        Err(StoreError::NodeExists(_)) => {}
        Err(StoreError::NoNode(_)) => {
            tracing::debug!(owner, "Node not registered yet, no liveness entry to restore")
        }
        Err(e) => tracing::warn!(owner, error = %e, "Could not recreate liveness entry"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const ADDR: &str = "10.0.0.2:2181";

    fn fast_config() -> ClientConfig {
        ClientConfig {
            retry_delay_ms: 1,
            max_retry_delay_ms: 1,
            write_retry_delay_ms: 1,
            lock_retry_delay_ms: 1,
            ..ClientConfig::default()
        }
    }

    async fn connected(store: &MemoryStore, owner: &str, config: ClientConfig) -> CoordinationClient {
        let client = CoordinationClient::new(Arc::new(store.clone()), config);
        client
            .connect(owner, ADDR, Duration::from_secs(60))
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let client = CoordinationClient::new(Arc::new(MemoryStore::new()), fast_config());
        assert!(matches!(client.get("/a").await, Err(Error::NotInitialized)));
        assert!(matches!(
            client.set("/a", b"x", false, None).await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            client.delete_recursive("/a").await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;
        let first = client.session_id().await.unwrap();

        client
            .connect("10.0.0.1", ADDR, Duration::from_secs(60))
            .await
            .unwrap();
        assert_ne!(client.session_id().await.unwrap(), first);
        assert_eq!(store.live_sessions(), 1);
        assert_eq!(client.owner().await.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_connect_gives_up_when_bounded() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let client = CoordinationClient::new(
            Arc::new(store),
            ClientConfig {
                connect_attempts: Some(3),
                ..fast_config()
            },
        );

        let err = client
            .connect("10.0.0.1", ADDR, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_set_creates_then_updates() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        let outcome = client.set("/a", b"one", false, None).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Applied { version: 0 });
        let outcome = client.set("/a", b"two", false, None).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Applied { version: 1 });

        assert_eq!(client.get_versioned("/a").await.unwrap(), (b"two".to_vec(), 1));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        client.set("/a", b"v0", false, None).await.unwrap();
        let (_, v0) = client.get_versioned("/a").await.unwrap();
        client.set("/a", b"v1", false, Some(v0)).await.unwrap();

        let err = client.set("/a", b"v2", false, Some(v0)).await.unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(client.get("/a").await.unwrap(), b"v1");

        let (_, v1) = client.get_versioned("/a").await.unwrap();
        let outcome = client.set("/a", b"v2", false, Some(v1)).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Applied { version: v1 + 1 });
    }

    #[tokio::test]
    async fn test_versioned_set_on_missing_node_fails() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        let err = client.set("/gone", b"x", false, Some(3)).await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed { op: "set", .. }));
        assert!(!client.exists("/gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_abandoned_after_retries() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        // Parent missing: every create attempt fails.
        let outcome = client.set("/missing/child", b"x", false, None).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Abandoned);
        assert!(!store.contains("/missing/child"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        store.inject_transient_failures(4);
        assert!(client.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_retries_can_be_bounded() {
        let store = MemoryStore::new();
        let config = ClientConfig {
            max_operation_attempts: Some(2),
            ..fast_config()
        };
        let client = connected(&store, "10.0.0.1", config).await;

        store.inject_transient_failures(5);
        assert!(matches!(
            client.exists("/").await,
            Err(Error::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_restores_liveness() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;
        client.ensure_path(&paths::node_path("10.0.0.1")).await.unwrap();
        client
            .create(&paths::live_path("10.0.0.1"), paths::DUMMY_DATA, true)
            .await
            .unwrap();

        let old = client.session_id().await.unwrap();
        store.expire_session(old);
        assert!(!store.contains(&paths::live_path("10.0.0.1")));

        // Any operation notices the loss and reconnects.
        assert!(client.exists(paths::NODES_PATH).await.unwrap());
        assert_ne!(client.session_id().await.unwrap(), old);
        assert!(store.contains(&paths::live_path("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_repeated_session_loss_surfaces() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        // One drop for the operation, one consumed by the liveness restore,
        // one for the single retry.
        store.inject_disconnects(3);
        assert!(matches!(
            client.get("/").await,
            Err(Error::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_path_and_children() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        client.ensure_path("/a/b/c").await.unwrap();
        client.ensure_path("/a/b/c").await.unwrap();
        assert!(client.exists("/a/b/c").await.unwrap());
        assert_eq!(client.children("/a").await.unwrap(), vec!["b"]);
        assert!(client.children("/nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_path_propagates() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        let err = client.get("no-slash").await.unwrap_err();
        assert!(matches!(
            err,
            Error::OperationFailed {
                source: StoreError::BadArguments(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_delete_recursive_continues_past_failures() {
        let store = MemoryStore::new();
        let client = connected(&store, "10.0.0.1", fast_config()).await;

        client.ensure_path("/t/a").await.unwrap();
        client.ensure_path("/t/b").await.unwrap();
        client.ensure_path("/t/c").await.unwrap();
        store.deny_delete("/t/b");

        client.delete_recursive("/t").await.unwrap();
        assert!(!store.contains("/t/a"));
        assert!(store.contains("/t/b"));
        assert!(!store.contains("/t/c"));
        assert!(store.contains("/t"));

        store.allow_delete("/t/b");
        client.delete_recursive("/t").await.unwrap();
        assert!(!store.contains("/t"));
    }

    #[tokio::test]
    async fn test_connect_any_adds_default_port_and_retries() {
        let store = MemoryStore::new();
        let client = CoordinationClient::new(
            Arc::new(store.clone()),
            ClientConfig {
                connect_attempts: Some(1),
                ..fast_config()
            },
        );
        assert!(matches!(
            client.connect_any("10.0.0.1", &[]).await,
            Err(Error::InvalidConfiguration(_))
        ));

        store.set_reachable(false);
        let reopen = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.set_reachable(true);
            })
        };

        client
            .connect_any("10.0.0.1", &["10.0.0.2".to_string(), "10.0.0.3".to_string()])
            .await
            .unwrap();
        reopen.await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(store.live_sessions(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_reconnect() {
        let store = MemoryStore::new();
        let client = Arc::new(connected(&store, "10.0.0.1", fast_config()).await);
        let old = client.session_id().await.unwrap();

        store.expire_session(old);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.exists("/").await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        assert_eq!(store.live_sessions(), 1);
        assert_ne!(client.session_id().await.unwrap(), old);
    }
}
