//! Controller state snapshots
//!
//! Snapshots are written to `/controller/state` under the cluster lock and
//! mirrored to a local file, so a controller can recover its view even when
//! the coordination store lost it.

use crate::common::{Error, Result};
use crate::coordination::client::{CoordinationClient, WriteOutcome};
use crate::coordination::lock::ClusterLock;
use crate::coordination::paths;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct StateSnapshots {
    client: Arc<CoordinationClient>,
    lock: ClusterLock,
    local_path: PathBuf,
}

impl StateSnapshots {
    pub fn new(client: Arc<CoordinationClient>, lock: ClusterLock, local_path: impl Into<PathBuf>) -> Self {
        Self {
            client,
            lock,
            local_path: local_path.into(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Store `state` cluster-wide and locally.
    pub async fn write<T: Serialize>(&self, owner: &str, state: &T) -> Result<WriteOutcome> {
        let data = serde_json::to_vec(state)?;
        let outcome = self
            .lock
            .run_exclusive(owner, || async {
                self.client.ensure_path(paths::ROOT_PATH).await?;
                self.client.set(paths::STATE_PATH, &data, false, None).await
            })
            .await?;

        self.write_local(&data)?;
        tracing::debug!(owner, bytes = data.len(), ?outcome, "Saved controller state");
        Ok(outcome)
    }

    fn write_local(&self, data: &[u8]) -> Result<()> {
        if let Some(dir) = self.local_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.local_path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.local_path)?;
        Ok(())
    }

    /// Latest snapshot from the store, falling back to the local copy.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<T> {
        match self.client.get(paths::STATE_PATH).await {
            Ok(data) => return Ok(serde_json::from_slice(&data)?),
            Err(Error::NotInitialized) => return Err(Error::NotInitialized),
            Err(Error::NotFound(_)) => {
                tracing::info!("No controller state in the coordination store, trying local copy");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not read controller state from the coordination store, trying local copy");
            }
        }

        match std::fs::read(&self.local_path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StateNotFound),
            Err(e) => Err(e.into()),
        }
    }
}
