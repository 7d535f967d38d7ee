//! Cluster membership registry
//!
//! Each controller keeps a subtree under `/controller/nodes/<ip>`:
//! - `live`: ephemeral, present while the controller's session is
//! - `done_loading`: whether the node finished applying its roles
//! - `job_data`: the node's serialized role model
//!
//! Peers poll these to tell live nodes from dead ones and to learn what a
//! failed node was running. Losing `live` does not remove the role data;
//! only an explicit deregistration does.

use crate::cluster::node::NodeRoleModel;
use crate::common::{timestamp_now, Error, Result};
use crate::coordination::client::{CoordinationClient, WriteOutcome};
use crate::coordination::paths;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Membership list shared by all controllers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpList {
    pub ips: Vec<String>,
    pub last_updated: u64,
}

/// Application instance hosted on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstance {
    pub app_name: String,
    pub ip: String,
    pub port: u16,
}

/// A node's request to change how many AppServers run an application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
}

impl ScalingDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingDecision::ScaleUp => "scale_up",
            ScalingDecision::ScaleDown => "scale_down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scale_up" => Some(ScalingDecision::ScaleUp),
            "scale_down" => Some(ScalingDecision::ScaleDown),
            _ => None,
        }
    }
}

/// Per-node liveness, readiness and role data
pub struct NodeRegistry {
    client: Arc<CoordinationClient>,
    keyname: String,
}

impl NodeRegistry {
    pub fn new(client: Arc<CoordinationClient>, keyname: impl Into<String>) -> Self {
        Self {
            client,
            keyname: keyname.into(),
        }
    }

    /// Publish `node` so peers can see it is alive and what it runs.
    pub async fn register_node(&self, node: &NodeRoleModel, done_loading: bool) -> Result<()> {
        let ip = node.private_ip();
        self.client.ensure_path(&paths::node_path(ip)).await?;
        self.reestablish_liveness(ip).await?;
        self.mark_done_loading(ip, done_loading).await?;
        self.set_role_data(ip, node).await?;
        tracing::info!(node = %node, done_loading, "Registered node");
        Ok(())
    }

    /// Remove everything stored for `ip`. Failures on single entries are
    /// logged and skipped.
    pub async fn deregister_node(&self, ip: &str) -> Result<()> {
        tracing::info!(ip, "Removing node information");
        self.client.delete_recursive(&paths::node_path(ip)).await
    }

    /// Recreate the ephemeral liveness marker for `ip` on the current session.
    pub async fn reestablish_liveness(&self, ip: &str) -> Result<()> {
        match self
            .client
            .create(&paths::live_path(ip), paths::DUMMY_DATA, true)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_node_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn is_live(&self, ip: &str) -> Result<bool> {
        let live = self.client.exists(&paths::live_path(ip)).await?;
        tracing::debug!(ip, live, "Checked node liveness");
        Ok(live)
    }

    pub async fn mark_done_loading(&self, ip: &str, done: bool) -> Result<WriteOutcome> {
        let value = serde_json::to_vec(&done)?;
        self.client
            .set(&paths::done_loading_path(ip), &value, false, None)
            .await
    }

    /// `false` when the flag is missing or unreadable.
    pub async fn is_done_loading(&self, ip: &str) -> Result<bool> {
        match self.client.get(&paths::done_loading_path(ip)).await {
            Ok(data) => Ok(serde_json::from_slice(&data).unwrap_or(false)),
            Err(Error::NotInitialized) => Err(Error::NotInitialized),
            Err(e) => {
                tracing::debug!(ip, error = %e, "Could not read done_loading flag");
                Ok(false)
            }
        }
    }

    pub async fn get_role_data(&self, ip: &str) -> Result<NodeRoleModel> {
        match self.client.get(&paths::job_data_path(ip)).await {
            Ok(data) => NodeRoleModel::deserialize(&data, &self.keyname),
            Err(Error::NotFound(_)) => Err(Error::RoleDataNotFound(ip.to_string())),
            Err(e) => Err(e),
        }
    }

    pub async fn set_role_data(&self, ip: &str, node: &NodeRoleModel) -> Result<WriteOutcome> {
        let data = node.serialize()?;
        self.client
            .set(&paths::job_data_path(ip), &data, false, None)
            .await
    }

    /// IPs with a subtree under `/controller/nodes`.
    pub async fn list_nodes(&self) -> Result<Vec<String>> {
        self.client.children(paths::NODES_PATH).await
    }

    // === Role changes ===
    // Callers hold the cluster lock around these. A dropped write leaves the
    // stored roles untouched and returns them unchanged.

    /// Give `ip` additional roles; the node will pick them up and reload.
    pub async fn add_roles(&self, ip: &str, roles: &[&str]) -> Result<NodeRoleModel> {
        self.update_roles(ip, |node| node.add_roles(roles)).await
    }

    /// Take roles away from `ip`; the node will stop them and reload.
    pub async fn remove_roles(&self, ip: &str, roles: &[&str]) -> Result<NodeRoleModel> {
        self.update_roles(ip, |node| node.remove_roles(roles)).await
    }

    async fn update_roles<F>(&self, ip: &str, change: F) -> Result<NodeRoleModel>
    where
        F: FnOnce(&mut NodeRoleModel),
    {
        let previous = self.get_role_data(ip).await?;
        let mut node = previous.clone();
        change(&mut node);
        if let WriteOutcome::Abandoned = self.set_role_data(ip, &node).await? {
            tracing::warn!(ip, wanted = %node, "Role change was dropped, node keeps its previous roles");
            return Ok(previous);
        }
        self.mark_done_loading(ip, false).await?;
        self.touch_ip_list().await?;
        tracing::info!(ip, node = %node, "Updated node roles");
        Ok(node)
    }

    // === Membership list ===

    /// Current list, or an empty one if none was written yet.
    pub async fn ip_list(&self) -> Result<IpList> {
        match self.client.get(paths::IPS_PATH).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(Error::NotFound(_)) => Ok(IpList::default()),
            Err(e) => Err(e),
        }
    }

    async fn write_ip_list(&self, list: &IpList) -> Result<()> {
        self.client.ensure_path(paths::ROOT_PATH).await?;
        let data = serde_json::to_vec(list)?;
        self.client.set(paths::IPS_PATH, &data, false, None).await?;
        Ok(())
    }

    /// Add `ip` to the membership list. Returns the new timestamp, or `None`
    /// if the list already had it.
    pub async fn add_ip(&self, ip: &str) -> Result<Option<u64>> {
        let mut list = self.ip_list().await?;
        if list.ips.iter().any(|known| known == ip) {
            tracing::debug!(ip, "IP list already includes this node, skipping");
            return Ok(None);
        }
        list.ips.push(ip.to_string());
        list.last_updated = timestamp_now();
        self.write_ip_list(&list).await?;
        tracing::debug!(ip, last_updated = list.last_updated, "Added node to IP list");
        Ok(Some(list.last_updated))
    }

    pub async fn remove_ip(&self, ip: &str) -> Result<Option<u64>> {
        if !self.client.exists(paths::IPS_PATH).await? {
            return Ok(None);
        }
        let mut list = self.ip_list().await?;
        list.ips.retain(|known| known != ip);
        list.last_updated = timestamp_now();
        self.write_ip_list(&list).await?;
        Ok(Some(list.last_updated))
    }

    /// Bump the list timestamp so peers refresh their view of the cluster.
    pub async fn touch_ip_list(&self) -> Result<u64> {
        let mut list = self.ip_list().await?;
        list.last_updated = timestamp_now();
        self.write_ip_list(&list).await?;
        Ok(list.last_updated)
    }

    /// Members of the IP list whose liveness marker is gone.
    pub async fn failed_nodes(&self) -> Result<Vec<String>> {
        let list = self.ip_list().await?;
        let mut failed = Vec::new();
        for ip in list.ips {
            if !self.is_live(&ip).await? {
                failed.push(ip);
            }
        }
        if !failed.is_empty() {
            tracing::warn!(failed = ?failed, "Found failed nodes");
        }
        Ok(failed)
    }

    // === Hosted applications ===

    pub async fn app_instances(&self, ip: &str) -> Result<Vec<AppInstance>> {
        match self.client.get(&paths::app_instance_path(ip)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn add_app_instance(&self, app_name: &str, ip: &str, port: u16) -> Result<()> {
        let mut instances = self.app_instances(ip).await?;
        instances.push(AppInstance {
            app_name: app_name.to_string(),
            ip: ip.to_string(),
            port,
        });
        let data = serde_json::to_vec(&instances)?;
        self.client
            .set(&paths::app_instance_path(ip), &data, false, None)
            .await?;
        Ok(())
    }

    // === Scaling requests ===

    pub async fn request_scale_up_for_app(&self, app_name: &str, ip: &str) -> Result<bool> {
        self.request_scaling(app_name, ip, ScalingDecision::ScaleUp)
            .await
    }

    pub async fn request_scale_down_for_app(&self, app_name: &str, ip: &str) -> Result<bool> {
        self.request_scaling(app_name, ip, ScalingDecision::ScaleDown)
            .await
    }

    /// Record `ip`'s request for `app_name`, replacing any earlier one.
    /// `false` when the request could not be written.
    async fn request_scaling(
        &self,
        app_name: &str,
        ip: &str,
        decision: ScalingDecision,
    ) -> Result<bool> {
        let path = paths::scale_request_path(app_name, ip);
        let written = match self.client.ensure_path(&paths::scale_app_path(app_name)).await {
            Ok(()) => {
                self.client
                    .set(&path, decision.as_str().as_bytes(), false, None)
                    .await
            }
            Err(e) => Err(e),
        };

        match written {
            Ok(WriteOutcome::Applied { .. }) => {
                tracing::debug!(app = app_name, ip, decision = decision.as_str(), "Requested scaling");
                Ok(true)
            }
            Ok(WriteOutcome::Abandoned) => Ok(false),
            Err(Error::NotInitialized) => Err(Error::NotInitialized),
            Err(e) => {
                tracing::warn!(app = app_name, ip, error = %e, "Could not record scaling request");
                Ok(false)
            }
        }
    }

    /// Outstanding scaling requests for `app_name`, one per requesting node.
    pub async fn get_scaling_requests_for_app(&self, app_name: &str) -> Result<Vec<ScalingDecision>> {
        let app_path = paths::scale_app_path(app_name);
        let mut requests = Vec::new();
        for ip in self.client.children(&app_path).await? {
            let data = match self.client.get(&paths::scale_request_path(app_name, &ip)).await {
                Ok(data) => data,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let value = String::from_utf8_lossy(&data);
            match ScalingDecision::parse(&value) {
                Some(decision) => requests.push(decision),
                None => tracing::warn!(app = app_name, ip = %ip, value = %value, "Ignoring unknown scaling request"),
            }
        }
        Ok(requests)
    }

    pub async fn clear_scaling_requests_for_app(&self, app_name: &str) -> Result<()> {
        self.client
            .delete_recursive(&paths::scale_app_path(app_name))
            .await
    }
}
