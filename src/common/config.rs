//! Configuration for appscale-coord components

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the coordination store listens on in AppScale deployments
pub const DEFAULT_STORE_PORT: u16 = 2181;

/// Environment prefix for overrides, e.g. `APPSCALE_COORD__CLIENT__RETRY_DELAY_MS=500`
const ENV_PREFIX: &str = "APPSCALE_COORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity this controller uses in the store (its private IP)
    #[serde(default)]
    pub node_id: String,

    /// Deployment key name, used to derive per-node SSH key paths
    #[serde(default = "default_keyname")]
    pub keyname: String,

    /// Coordination client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Quorum wait settings
    #[serde(default)]
    pub quorum: QuorumConfig,

    /// Local copy of the controller state snapshot
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_keyname() -> String {
    "appscale".to_string()
}
fn default_state_path() -> PathBuf {
    PathBuf::from("/etc/appscale/controller_state.json")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            keyname: default_keyname(),
            client: ClientConfig::default(),
            quorum: QuorumConfig::default(),
            state_path: default_state_path(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("client.store_addresses")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the client or quorum loops misbehave.
    pub fn validate(&self) -> crate::Result<()> {
        if self.client.write_attempts == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "client.write_attempts must be at least 1".into(),
            ));
        }
        if self.client.max_retry_delay_ms < self.client.retry_delay_ms {
            return Err(crate::Error::InvalidConfiguration(
                "client.max_retry_delay_ms must not be below client.retry_delay_ms".into(),
            ));
        }
        if self.quorum.poll_interval_ms == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "quorum.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Coordination client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Store endpoints (`host:port`); one is picked at random on connect
    #[serde(default)]
    pub store_addresses: Vec<String>,

    /// Session timeout; values at or below 10s tend to flap
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Delay between retries of a store primitive
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Ceiling for the doubling retry delay
    #[serde(default = "default_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Attempts for a transiently failing primitive (unbounded when absent)
    #[serde(default)]
    pub max_operation_attempts: Option<u32>,

    /// Attempts to open a session on connect (unbounded when absent)
    #[serde(default)]
    pub connect_attempts: Option<u32>,

    /// Attempts for a write before it is abandoned
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    /// Delay between write attempts
    #[serde(default = "default_write_retry_delay")]
    pub write_retry_delay_ms: u64,

    /// Delay before retrying a contended cluster lock
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
}

fn default_session_timeout() -> u64 {
    60
}
fn default_retry_delay() -> u64 {
    1_000
}
fn default_write_attempts() -> u32 {
    5
}
fn default_write_retry_delay() -> u64 {
    5_000
}
fn default_lock_retry_delay() -> u64 {
    5_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_addresses: Vec::new(),
            session_timeout_secs: default_session_timeout(),
            retry_delay_ms: default_retry_delay(),
            max_retry_delay_ms: default_retry_delay(),
            max_operation_attempts: None,
            connect_attempts: None,
            write_attempts: default_write_attempts(),
            write_retry_delay_ms: default_write_retry_delay(),
            lock_retry_delay_ms: default_lock_retry_delay(),
        }
    }
}

impl ClientConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

/// Quorum wait configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Replication factor of the backing store
    #[serde(default = "default_replication")]
    pub replication: usize,

    /// How often the health probe is polled
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Ceiling on waiting for full replication once quorum is met
    #[serde(default = "default_replication_timeout")]
    pub replication_timeout_secs: u64,
}

fn default_replication() -> usize {
    3
}
fn default_poll_interval() -> u64 {
    5_000
}
fn default_replication_timeout() -> u64 {
    60
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            replication: default_replication(),
            poll_interval_ms: default_poll_interval(),
            replication_timeout_secs: default_replication_timeout(),
        }
    }
}

impl QuorumConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_timeout_secs)
    }
}

/// Store address for `host`, adding the default port when none is given.
pub fn store_address(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_STORE_PORT)
    }
}
