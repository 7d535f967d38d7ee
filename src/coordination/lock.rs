//! Cluster-wide mutual exclusion
//!
//! The lock is an ephemeral node whose value is the JSON-encoded identity of
//! its holder. The store lets at most one create of a path succeed, and the
//! node vanishes with the holder's session, so a crashed holder never wedges
//! the cluster for longer than the session timeout.

use crate::common::{Error, Result};
use crate::coordination::client::CoordinationClient;
use crate::coordination::paths;
use crate::store::parent_path;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Named lock backed by an ephemeral store node
pub struct ClusterLock {
    client: Arc<CoordinationClient>,
    path: String,
    retry_delay: Duration,
}

impl ClusterLock {
    /// The controller lock at `/controller/lock`.
    pub fn new(client: Arc<CoordinationClient>) -> Self {
        Self::with_path(client, paths::LOCK_PATH)
    }

    pub fn with_path(client: Arc<CoordinationClient>, path: &str) -> Self {
        let retry_delay = client.config().lock_retry_delay();
        Self {
            client,
            path: path.to_string(),
            retry_delay,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn ensure_parent(&self) -> Result<()> {
        match parent_path(&self.path) {
            Some(parent) => self.client.ensure_path(parent).await,
            None => Ok(()),
        }
    }

    /// Try to take the lock for `owner`. `false` means someone holds it.
    pub async fn try_acquire(&self, owner: &str) -> Result<bool> {
        self.ensure_parent().await?;
        let value = serde_json::to_vec(owner)?;
        match self.client.create(&self.path, &value, true).await {
            Ok(()) => {
                tracing::debug!(owner, lock = %self.path, "Acquired cluster lock");
                Ok(true)
            }
            Err(e) if e.is_node_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Identity of the current holder, if any.
    pub async fn current_owner(&self) -> Result<Option<String>> {
        match self.client.get(&self.path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Release the lock if `owner` holds it through this client's session;
    /// otherwise nothing happens.
    ///
    /// The holder check and the delete are two operations. If this session
    /// expires between them, the delete runs on the replacement session and
    /// can remove a lock another node took in the meantime.
    pub async fn release(&self, owner: &str) -> Result<()> {
        let (data, stat) = match self.client.get_with_stat(&self.path).await {
            Ok(found) => found,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let holder: String = serde_json::from_slice(&data)?;
        if holder != owner {
            tracing::debug!(owner, holder = %holder, "Not releasing a lock held by another owner");
            return Ok(());
        }

        let session = self.client.session_id().await;
        if stat.ephemeral_owner.is_none() || stat.ephemeral_owner != session {
            tracing::debug!(owner, "Not releasing a lock taken by another session under the same identity");
            return Ok(());
        }
        self.force_release().await
    }

    /// Delete the lock node regardless of who holds it.
    pub async fn force_release(&self) -> Result<()> {
        match self.client.delete(&self.path).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run `f` while holding the lock.
    ///
    /// If the lock is already held under `owner`'s identity the block runs
    /// without acquiring, and the lock is left in place afterwards. Other
    /// holders cause a wait of `retry_delay` before trying again. The lock is
    /// released on every exit path when this call took it; errors from `f`
    /// are returned after the release.
    pub async fn run_exclusive<F, Fut, T>(&self, owner: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let acquired = self.acquire_or_join(owner).await?;

        let result = f().await;
        if let Err(e) = &result {
            tracing::error!(owner, error = %e, "Ran caller's block under the cluster lock but it failed");
        }

        if acquired {
            if let Err(e) = self.release(owner).await {
                tracing::warn!(owner, error = %e, "Failed to release cluster lock");
            }
        }
        result
    }

    /// Returns whether this call acquired the lock (as opposed to finding it
    /// already held under the same identity).
    async fn acquire_or_join(&self, owner: &str) -> Result<bool> {
        loop {
            match self.try_acquire(owner).await {
                Ok(true) => return Ok(true),
                Ok(false) => match self.current_owner().await {
                    Ok(Some(holder)) if holder == owner => return Ok(false),
                    Ok(Some(holder)) => {
                        tracing::warn!(owner, holder = %holder, "Tried to get the lock, but it's currently owned by another node. Will try again later");
                    }
                    // Released between our create and our read.
                    Ok(None) => continue,
                    Err(Error::NotInitialized) => return Err(Error::NotInitialized),
                    Err(e) => tracing::warn!(owner, error = %e, "Could not read lock owner"),
                },
                Err(Error::NotInitialized) => return Err(Error::NotInitialized),
                Err(e) => tracing::warn!(owner, error = %e, "Error while acquiring cluster lock"),
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ClientConfig;
    use crate::store::MemoryStore;

    async fn client_for(store: &MemoryStore, owner: &str) -> Arc<CoordinationClient> {
        let client = CoordinationClient::new(
            Arc::new(store.clone()),
            ClientConfig {
                retry_delay_ms: 1,
                max_retry_delay_ms: 1,
                write_retry_delay_ms: 1,
                lock_retry_delay_ms: 5,
                ..ClientConfig::default()
            },
        );
        client
            .connect(owner, "memory:2181", Duration::from_secs(60))
            .await
            .unwrap();
        Arc::new(client)
    }

    #[tokio::test]
    async fn test_try_acquire_and_release() {
        let store = MemoryStore::new();
        let a = ClusterLock::new(client_for(&store, "10.0.0.1").await);
        let b = ClusterLock::new(client_for(&store, "10.0.0.2").await);

        assert!(a.try_acquire("10.0.0.1").await.unwrap());
        assert!(!b.try_acquire("10.0.0.2").await.unwrap());
        assert_eq!(
            b.current_owner().await.unwrap().as_deref(),
            Some("10.0.0.1")
        );

        // Non-owner release leaves the lock alone.
        b.release("10.0.0.2").await.unwrap();
        assert_eq!(
            a.current_owner().await.unwrap().as_deref(),
            Some("10.0.0.1")
        );

        a.release("10.0.0.1").await.unwrap();
        assert_eq!(a.current_owner().await.unwrap(), None);
        assert!(b.try_acquire("10.0.0.2").await.unwrap());

        // Releasing an absent lock is harmless.
        b.release("10.0.0.2").await.unwrap();
        b.release("10.0.0.2").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_dies_with_session() {
        let store = MemoryStore::new();
        let a_client = client_for(&store, "10.0.0.1").await;
        let a = ClusterLock::new(a_client.clone());
        let b = ClusterLock::new(client_for(&store, "10.0.0.2").await);

        assert!(a.try_acquire("10.0.0.1").await.unwrap());
        store.expire_session(a_client.session_id().await.unwrap());
        assert!(b.try_acquire("10.0.0.2").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_on_error() {
        let store = MemoryStore::new();
        let lock = ClusterLock::new(client_for(&store, "10.0.0.1").await);

        let result: Result<()> = lock
            .run_exclusive("10.0.0.1", || async { Err(Error::Other("boom".into())) })
            .await;
        assert!(matches!(result, Err(Error::Other(ref m)) if m == "boom"));
        assert_eq!(lock.current_owner().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_exclusive_same_identity_does_not_release() {
        let store = MemoryStore::new();
        let lock = ClusterLock::new(client_for(&store, "10.0.0.1").await);

        assert!(lock.try_acquire("10.0.0.1").await.unwrap());
        let value = lock
            .run_exclusive("10.0.0.1", || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(
            lock.current_owner().await.unwrap().as_deref(),
            Some("10.0.0.1")
        );
    }

    #[tokio::test]
    async fn test_run_exclusive_waits_for_holder() {
        let store = MemoryStore::new();
        let holder = Arc::new(ClusterLock::new(client_for(&store, "10.0.0.1").await));
        let waiter = ClusterLock::new(client_for(&store, "10.0.0.2").await);

        assert!(holder.try_acquire("10.0.0.1").await.unwrap());
        let releaser = {
            let holder = holder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                holder.release("10.0.0.1").await.unwrap();
            })
        };

        let owner_inside = waiter
            .run_exclusive("10.0.0.2", || async { waiter.current_owner().await })
            .await
            .unwrap();
        assert_eq!(owner_inside.as_deref(), Some("10.0.0.2"));
        releaser.await.unwrap();
        assert_eq!(waiter.current_owner().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_ignores_lock_of_other_session() {
        let store = MemoryStore::new();
        let first = ClusterLock::new(client_for(&store, "10.0.0.1").await);
        let second = ClusterLock::new(client_for(&store, "10.0.0.1").await);

        assert!(first.try_acquire("10.0.0.1").await.unwrap());
        second.release("10.0.0.1").await.unwrap();
        assert_eq!(
            first.current_owner().await.unwrap().as_deref(),
            Some("10.0.0.1")
        );

        first.release("10.0.0.1").await.unwrap();
        assert_eq!(first.current_owner().await.unwrap(), None);
    }
}
