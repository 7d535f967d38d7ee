//! # appscale-coord
//!
//! Coordination core for AppScale controllers. Every controller in a
//! deployment talks to a shared, ZooKeeper-style coordination store to:
//! - hold a durable session that survives connection loss
//! - serialize cluster-wide changes behind a single lock
//! - publish its liveness, readiness and assigned roles
//! - gate startup on a replication quorum of the database nodes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Controller A │   │ Controller B │   │ Controller C │
//! │  (10.0.0.1)  │   │  (10.0.0.2)  │   │  (10.0.0.3)  │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │ session          │ session          │ session
//!   ┌────▼──────────────────▼──────────────────▼────┐
//!   │             Coordination store                │
//!   │  /controller/lock          (ephemeral)        │
//!   │  /controller/state                            │
//!   │  /controller/ips                              │
//!   │  /controller/nodes/<ip>/{live,done_loading,   │
//!   │                          job_data}            │
//!   └───────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Nodes needed for quorum
//! appscale-coord quorum --nodes 5 --replication 3
//!
//! # Normalize a role assignment
//! appscale-coord role-data --file ./node.json --keyname appscale
//!
//! # Show the effective configuration
//! appscale-coord config --file /etc/appscale/coord.toml
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod coordination;
pub mod store;

// Re-export commonly used types
pub use cluster::{NodeRoleModel, QuorumCoordinator};
pub use common::{Config, Error, Result};
pub use coordination::{ClusterLock, CoordinationClient, NodeRegistry, StateSnapshots};
pub use store::{CoordinationStore, MemoryStore, StoreSession};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
