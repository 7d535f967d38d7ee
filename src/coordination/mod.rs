//! Coordination-store access for controllers
//!
//! - `client`: session lifecycle, reconnect and retry policy
//! - `lock`: cluster-wide mutual exclusion
//! - `registry`: per-node liveness, readiness and role data
//! - `state`: controller state snapshots

pub mod client;
pub mod lock;
pub mod paths;
pub mod registry;
pub mod state;

pub use client::{CoordinationClient, WriteOutcome};
pub use lock::ClusterLock;
pub use registry::{AppInstance, IpList, NodeRegistry, ScalingDecision};
pub use state::StateSnapshots;
