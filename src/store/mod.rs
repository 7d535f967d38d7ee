//! Coordination store contract
//!
//! The store is a strongly consistent hierarchical key/value service
//! (ZooKeeper in AppScale deployments). This module defines the session
//! primitives the coordination client is built on and the return codes
//! those primitives produce. `memory` provides an in-process implementation.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;

/// Identifier of a store session; ephemeral entries are owned by one.
pub type SessionId = u64;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Return codes of store primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node exists: {0}")]
    NodeExists(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("bad version on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("not authorized: {0}")]
    NoAuth(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("session expired")]
    SessionExpired,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Errors that invalidate the session and require a new one.
    pub fn is_session_loss(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionClosed | StoreError::NotConnected | StoreError::SessionExpired
        )
    }

    /// Errors worth retrying on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Metadata returned alongside node data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Incremented on every successful set; 0 after create
    pub version: i32,
    /// Session owning the node if it is ephemeral
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
}

/// One open session against the store
#[async_trait]
pub trait StoreSession: Send + Sync {
    fn session_id(&self) -> SessionId;

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> StoreResult<()>;

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)>;

    /// Overwrite data; with `version` set the write only applies on a match.
    async fn set(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Close the session, dropping its ephemeral entries.
    async fn close(&self);
}

/// Factory for store sessions
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn open_session(
        &self,
        address: &str,
        session_timeout: Duration,
    ) -> StoreResult<Arc<dyn StoreSession>>;
}

/// Validate a store path: absolute, no trailing slash, no empty segments.
pub fn validate_path(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(StoreError::BadArguments(format!("invalid path: {:?}", path)));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(StoreError::BadArguments(format!(
            "path contains control characters: {:?}",
            path
        )));
    }
    Ok(())
}

/// Parent of a store path (`None` for the root).
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
