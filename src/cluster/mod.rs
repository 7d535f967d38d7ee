//! Node roles and replication quorum

pub mod node;
pub mod quorum;

pub use node::{roles, store_location, NodeRoleModel};
pub use quorum::{
    database_quorum, needed_for_quorum, HealthProbe, QuorumCoordinator, ReplicationStatus,
};
