//! Common utilities and types shared across the coordination crate

pub mod config;
pub mod error;
pub mod utils;

pub use config::{ClientConfig, Config, QuorumConfig};
pub use error::{Error, Result};
pub use utils::{retry_delay_for, timestamp_now};
