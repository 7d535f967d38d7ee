//! Error types for appscale-coord

use crate::store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Client lifecycle ===
    #[error("Coordination client used before connect succeeded")]
    NotInitialized,

    #[error("Lost connection to coordination store: {0}")]
    ConnectionLost(String),

    // === Store operations ===
    #[error("{op} failed on {path}: {source}")]
    OperationFailed {
        op: &'static str,
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Role assignment not found for node {0}")]
    RoleDataNotFound(String),

    #[error("Controller state not found in store or local backup")]
    StateNotFound,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Encoding / I/O ===
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map a store return code onto the client taxonomy.
    pub fn from_store(op: &'static str, path: &str, err: StoreError) -> Self {
        match err {
            StoreError::NoNode(missing) => Error::NotFound(missing),
            e if e.is_session_loss() => Error::ConnectionLost(e.to_string()),
            source => Error::OperationFailed {
                op,
                path: path.to_string(),
                source,
            },
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionLost(_) => true,
            Error::OperationFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Did a create fail because the path was already taken?
    pub fn is_node_exists(&self) -> bool {
        matches!(
            self,
            Error::OperationFailed {
                source: StoreError::NodeExists(_),
                ..
            }
        )
    }

    /// Did a versioned write lose a compare-and-swap race?
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            Error::OperationFailed {
                source: StoreError::BadVersion { .. },
                ..
            }
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
