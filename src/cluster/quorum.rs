//! Replication quorum math and the database bring-up wait
//!
//! Traffic is admitted once enough replicas of the backing store report
//! healthy. Quorum is mandatory and waited for without a deadline; full
//! replication beyond quorum is waited for only up to a fixed ceiling.

use crate::cluster::node::{roles, NodeRoleModel};
use crate::common::{Error, QuorumConfig, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Replicas that must be up for consistent reads and writes.
///
/// A replication factor of `r` tolerates `ceil(r / 2 - 1)` failures, so
/// `total_nodes` minus that many nodes are needed.
pub fn needed_for_quorum(total_nodes: usize, replication: usize) -> Result<usize> {
    if total_nodes < 1 {
        return Err(Error::InvalidConfiguration(format!(
            "need at least one node, got {}",
            total_nodes
        )));
    }
    if replication < 1 {
        return Err(Error::InvalidConfiguration(format!(
            "replication factor must be at least 1, got {}",
            replication
        )));
    }
    if replication > total_nodes {
        return Err(Error::InvalidConfiguration(format!(
            "replication factor {} exceeds node count {}",
            replication, total_nodes
        )));
    }

    // ceil(r / 2 - 1) == (r - 1) / 2 for r >= 1
    let tolerable_failures = (replication - 1) / 2;
    Ok(total_nodes - tolerable_failures)
}

/// Quorum for the database nodes among `nodes`.
pub fn database_quorum(nodes: &[NodeRoleModel], replication: usize) -> Result<usize> {
    let db_nodes = nodes
        .iter()
        .filter(|node| node.has_role(roles::DATABASE))
        .count();
    needed_for_quorum(db_nodes, replication)
}

/// Source of the replicas the backing store currently considers healthy
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn healthy_replicas(&self) -> anyhow::Result<HashSet<String>>;
}

#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HashSet<String>>> + Send + 'static,
{
    async fn healthy_replicas(&self) -> anyhow::Result<HashSet<String>> {
        (self)().await
    }
}

/// How far replication got before the wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    FullyReplicated,
    /// Quorum met, but the desired count was not reached in time.
    QuorumOnly { healthy: usize },
}

/// Gates cluster readiness on replica health
pub struct QuorumCoordinator {
    poll_interval: Duration,
    replication_timeout: Duration,
}

impl QuorumCoordinator {
    pub fn new(config: &QuorumConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            replication_timeout: config.replication_timeout(),
        }
    }

    pub fn with_timings(poll_interval: Duration, replication_timeout: Duration) -> Self {
        Self {
            poll_interval,
            replication_timeout,
        }
    }

    async fn healthy_count(&self, probe: &dyn HealthProbe) -> usize {
        match probe.healthy_replicas().await {
            Ok(healthy) => healthy.len(),
            Err(e) => {
                tracing::warn!(error = %e, "Health probe failed, counting no healthy replicas");
                0
            }
        }
    }

    /// Block until `needed` replicas are healthy, then give up to the
    /// replication timeout for `desired` of them.
    pub async fn wait_for_desired_nodes(
        &self,
        probe: &dyn HealthProbe,
        needed: usize,
        desired: usize,
    ) -> ReplicationStatus {
        let mut healthy;
        loop {
            healthy = self.healthy_count(probe).await;
            if healthy >= needed {
                tracing::info!(healthy, needed, "Quorum reached");
                break;
            }
            tracing::info!(healthy, needed, "Waiting for quorum");
            tokio::time::sleep(self.poll_interval).await;
        }

        // A probe that blocks must not stretch this phase past the deadline.
        let deadline = Instant::now() + self.replication_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.healthy_count(probe)).await {
                Ok(count) => healthy = count,
                Err(_) => {
                    tracing::warn!(
                        healthy,
                        desired,
                        timeout = ?self.replication_timeout,
                        "Health probe still running at the replication deadline, proceeding with quorum"
                    );
                    return ReplicationStatus::QuorumOnly { healthy };
                }
            }
            if healthy >= desired {
                tracing::info!(healthy, desired, "All desired replicas are healthy");
                return ReplicationStatus::FullyReplicated;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    healthy,
                    desired,
                    timeout = ?self.replication_timeout,
                    "Timed out waiting for full replication, proceeding with quorum"
                );
                return ReplicationStatus::QuorumOnly { healthy };
            }
            tokio::time::sleep_until(deadline.min(Instant::now() + self.poll_interval)).await;
        }
    }
}
