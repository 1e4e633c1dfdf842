//! Configuration for a tnet node
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `TNET_*` environment variables. The binaries apply CLI flags last.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{Error, Result};

/// File (under `data_dir`) holding the generated peer id
const PEER_ID_FILE: &str = "peer_id";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer ID announced to the network (generated and persisted if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,

    /// Directory for node-local state
    pub data_dir: PathBuf,

    /// Which local state store to run on
    pub state_backend: StateBackend,

    /// Broadcast channel shared by every peer
    pub channel: String,

    pub announce_interval_secs: u64,
    pub enforce_interval_secs: u64,
    pub prune_interval_secs: u64,

    /// Silence after which a peer is pruned
    pub peer_timeout_secs: u64,

    /// Number of distinct peers that should hold each object
    pub target_replication_factor: usize,

    /// Upper bound on storage used by pinned content (unbounded if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_ceiling_gb: Option<f64>,

    /// Window after which content with no known holder is forgotten
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ttl_secs: Option<u64>,

    /// Per-pin timeout (pins may run unbounded if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_timeout_secs: Option<u64>,

    /// Retry policy for failed pins
    pub pin_backoff: PinBackoff,

    /// Pin the scarcest content first instead of store order
    pub prioritize_scarce: bool,

    /// Kubo RPC endpoint (content store and pubsub)
    pub ipfs_api: String,

    /// Filesystem whose free space bounds local capacity
    pub disk_path: PathBuf,

    /// Admin HTTP API bind address (disabled if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_addr: Option<SocketAddr>,

    /// Logging level
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Rocksdb,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PinBackoff {
    /// Retry every pass
    None,
    /// Double the wait after each consecutive failure
    Exponential { base_secs: u64, max_secs: u64 },
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            data_dir: PathBuf::from("./tnet-data"),
            state_backend: StateBackend::Rocksdb,
            channel: "tnet-announce".to_string(),
            announce_interval_secs: 30,
            enforce_interval_secs: 45,
            prune_interval_secs: 45,
            peer_timeout_secs: 120,
            target_replication_factor: 3,
            storage_ceiling_gb: None,
            content_ttl_secs: None,
            pin_timeout_secs: None,
            pin_backoff: PinBackoff::None,
            prioritize_scarce: false,
            ipfs_api: "http://127.0.0.1:5001".to_string(),
            disk_path: PathBuf::from("/"),
            admin_addr: None,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("TNET").try_parsing(true));

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.channel.is_empty() {
            return Err(Error::InvalidConfig("channel cannot be empty".into()));
        }
        if self.announce_interval_secs == 0
            || self.enforce_interval_secs == 0
            || self.prune_interval_secs == 0
        {
            return Err(Error::InvalidConfig("intervals must be at least 1s".into()));
        }
        if self.peer_timeout_secs <= self.announce_interval_secs {
            return Err(Error::InvalidConfig(format!(
                "peer_timeout_secs ({}) must exceed announce_interval_secs ({})",
                self.peer_timeout_secs, self.announce_interval_secs
            )));
        }
        if self.target_replication_factor == 0 {
            return Err(Error::InvalidConfig(
                "target_replication_factor must be at least 1".into(),
            ));
        }
        if let Some(ceiling) = self.storage_ceiling_gb {
            if !ceiling.is_finite() || ceiling < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "storage_ceiling_gb must be a non-negative number, got {}",
                    ceiling
                )));
            }
        }
        if let PinBackoff::Exponential {
            base_secs,
            max_secs,
        } = self.pin_backoff
        {
            if base_secs == 0 || max_secs < base_secs {
                return Err(Error::InvalidConfig(
                    "pin_backoff needs 0 < base_secs <= max_secs".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn enforce_interval(&self) -> Duration {
        Duration::from_secs(self.enforce_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn pin_timeout(&self) -> Option<Duration> {
        self.pin_timeout_secs.map(Duration::from_secs)
    }

    /// Path of the RocksDB state directory
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Return the configured peer id, or the one persisted under `data_dir`,
    /// generating and persisting a fresh one on first start.
    pub fn resolve_peer_id(&self) -> Result<String> {
        if let Some(id) = &self.peer_id {
            crate::common::validate_id("peer_id", id)
                .map_err(|e| Error::InvalidConfig(e.to_string()))?;
            return Ok(id.clone());
        }

        let path = self.data_dir.join(PEER_ID_FILE);
        if path.exists() {
            let id = std::fs::read_to_string(&path)?.trim().to_string();
            if !id.is_empty() {
                return Ok(id);
            }
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let id = uuid::Uuid::new_v4().to_string();
        std::fs::write(&path, &id)?;
        tracing::info!(peer_id = %id, "Generated new peer id");
        Ok(id)
    }
}
