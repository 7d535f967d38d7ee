//! Node role model
//!
//! One `NodeRoleModel` describes a machine in the deployment: its addresses,
//! the roles it has been assigned, and the infrastructure metadata needed to
//! reach it. Controllers exchange it through the node registry as JSON.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Role names with meaning to the coordination layer
pub mod roles {
    /// Sentinel role of a machine with nothing assigned
    pub const OPEN: &str = "open";
    pub const DATABASE: &str = "database";
    pub const DB_MASTER: &str = "db_master";
    pub const TASKQUEUE: &str = "taskqueue";
    pub const TASKQUEUE_MASTER: &str = "taskqueue_master";
    pub const LOAD_BALANCER: &str = "load_balancer";
    pub const ZOOKEEPER: &str = "zookeeper";
    pub const SHADOW: &str = "shadow";
}

/// Directory holding per-cloud deployment keys
const KEY_DIR: &str = "/etc/appscale/keys";

/// Wire form of a node's role assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoleAssignment {
    public_ip: String,
    private_ip: String,
    roles: Vec<String>,
    #[serde(default)]
    instance_id: Option<String>,
    cloud: String,
    #[serde(default)]
    disk: Option<String>,
    #[serde(default)]
    instance_type: Option<String>,
}

/// A machine's identity and role set
#[derive(Debug, Clone)]
pub struct NodeRoleModel {
    public_ip: String,
    private_ip: String,
    roles: BTreeSet<String>,
    instance_id: Option<String>,
    cloud: String,
    disk: Option<String>,
    instance_type: Option<String>,
    ssh_key: PathBuf,
}

impl NodeRoleModel {
    pub fn new(
        public_ip: impl Into<String>,
        private_ip: impl Into<String>,
        roles: &[&str],
        cloud: impl Into<String>,
        keyname: &str,
    ) -> Self {
        let cloud = cloud.into();
        let mut node = Self {
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
            roles: BTreeSet::new(),
            instance_id: None,
            ssh_key: ssh_key_path(&cloud, keyname),
            cloud,
            disk: None,
            instance_type: None,
        };
        node.replace_roles(roles);
        node
    }

    pub fn with_instance(
        mut self,
        instance_id: impl Into<String>,
        instance_type: Option<String>,
        disk: Option<String>,
    ) -> Self {
        self.instance_id = Some(instance_id.into());
        self.instance_type = instance_type;
        self.disk = disk;
        self
    }

    /// Build from a role-assignment message: an object, or an array holding
    /// exactly one object.
    pub fn from_assignment(value: serde_json::Value, keyname: &str) -> Result<Self> {
        let object = match value {
            serde_json::Value::Object(_) => value,
            serde_json::Value::Array(mut items) if items.len() == 1 => items.remove(0),
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "role assignment must be an object or a one-element array, got {}",
                    other
                )))
            }
        };
        if !object.is_object() {
            return Err(Error::InvalidConfiguration(format!(
                "role assignment must be an object, got {}",
                object
            )));
        }

        let wire: RoleAssignment = serde_json::from_value(object)
            .map_err(|e| Error::InvalidConfiguration(format!("bad role assignment: {}", e)))?;
        Ok(Self::from_wire(wire, keyname))
    }

    fn from_wire(wire: RoleAssignment, keyname: &str) -> Self {
        let roles: Vec<&str> = wire.roles.iter().map(String::as_str).collect();
        let mut node = Self::new(wire.public_ip, wire.private_ip, &roles, wire.cloud, keyname);
        node.instance_id = wire.instance_id;
        node.disk = wire.disk;
        node.instance_type = wire.instance_type;
        node
    }

    fn to_wire(&self) -> RoleAssignment {
        RoleAssignment {
            public_ip: self.public_ip.clone(),
            private_ip: self.private_ip.clone(),
            roles: self.roles.iter().cloned().collect(),
            instance_id: self.instance_id.clone(),
            cloud: self.cloud.clone(),
            disk: self.disk.clone(),
            instance_type: self.instance_type.clone(),
        }
    }

    /// JSON blob stored as the node's `job_data`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_wire())?)
    }

    pub fn deserialize(data: &[u8], keyname: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        Self::from_assignment(value, keyname)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_wire()).unwrap_or_default()
    }

    // === Role mutation ===

    pub fn add_roles(&mut self, roles: &[&str]) {
        for role in roles.iter().filter(|r| !r.is_empty()) {
            self.roles.insert(role.to_string());
        }
        if self.roles.len() > 1 {
            self.roles.remove(roles::OPEN);
        }
        self.normalize();
    }

    pub fn remove_roles(&mut self, roles: &[&str]) {
        for role in roles {
            self.roles.remove(*role);
        }
        self.normalize();
    }

    pub fn replace_roles(&mut self, roles: &[&str]) {
        self.roles = roles
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| r.to_string())
            .collect();
        if self.roles.len() > 1 {
            self.roles.remove(roles::OPEN);
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        if self.roles.is_empty() {
            self.roles.insert(roles::OPEN.to_string());
        }
    }

    // === Predicates ===

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn is_open(&self) -> bool {
        self.roles.len() == 1 && self.has_role(roles::OPEN)
    }

    /// Database replica that is not the elected master.
    pub fn is_db_replica(&self) -> bool {
        self.has_role(roles::DATABASE) && !self.has_role(roles::DB_MASTER)
    }

    /// Queue replica that is not the elected master.
    pub fn is_taskqueue_replica(&self) -> bool {
        self.has_role(roles::TASKQUEUE) && !self.has_role(roles::TASKQUEUE_MASTER)
    }

    // === Accessors ===

    pub fn public_ip(&self) -> &str {
        &self.public_ip
    }

    pub fn private_ip(&self) -> &str {
        &self.private_ip
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn cloud(&self) -> &str {
        &self.cloud
    }

    pub fn disk(&self) -> Option<&str> {
        self.disk.as_deref()
    }

    pub fn instance_type(&self) -> Option<&str> {
        self.instance_type.as_deref()
    }

    pub fn ssh_key(&self) -> &PathBuf {
        &self.ssh_key
    }
}

impl PartialEq for NodeRoleModel {
    fn eq(&self, other: &Self) -> bool {
        self.ssh_key == other.ssh_key
            && self.private_ip == other.private_ip
            && self.public_ip == other.public_ip
    }
}

impl Eq for NodeRoleModel {}

impl fmt::Display for NodeRoleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let roles: Vec<&str> = self.roles().collect();
        write!(
            f,
            "{} ({}) [{}]",
            self.public_ip,
            self.private_ip,
            roles.join(", ")
        )
    }
}

fn ssh_key_path(cloud: &str, keyname: &str) -> PathBuf {
    PathBuf::from(KEY_DIR)
        .join(cloud)
        .join(format!("{}.key", keyname))
}

/// Private IP of the coordination store this node should talk to: itself if
/// it runs the store, otherwise the first peer that does.
pub fn store_location(my_node: &NodeRoleModel, all_nodes: &[NodeRoleModel]) -> Result<String> {
    if my_node.has_role(roles::ZOOKEEPER) {
        return Ok(my_node.private_ip.clone());
    }

    all_nodes
        .iter()
        .find(|node| node.has_role(roles::ZOOKEEPER))
        .map(|node| node.private_ip.clone())
        .ok_or_else(|| {
            let peers: Vec<String> = all_nodes.iter().map(|n| n.to_string()).collect();
            Error::InvalidConfiguration(format!(
                "no coordination store nodes found; nodes are [{}], this node is {}",
                peers.join("; "),
                my_node
            ))
        })
}
