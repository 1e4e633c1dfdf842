//! Common utilities and types shared across tnet

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{NodeConfig, PinBackoff, StateBackend};
pub use error::{Error, Result};
pub use metrics::NodeMetrics;
pub use utils::{bytes_to_gb, format_bytes, parse_duration, timestamp_now, validate_id};
