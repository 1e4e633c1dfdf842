//! Node binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tnet::common::{parse_duration, StateBackend};
use tnet::{Node, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tnet-node")]
#[command(about = "tnet replication node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Serve {
        /// TOML config file (TNET_* environment variables also apply)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Peer ID (persisted under the data directory if omitted)
        #[arg(long)]
        peer_id: Option<String>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Kubo RPC API URL
        #[arg(long)]
        ipfs_api: Option<String>,

        /// Admin API bind address
        #[arg(long)]
        admin: Option<SocketAddr>,

        /// Target replication factor
        #[arg(long)]
        target: Option<usize>,

        /// Storage ceiling in GB
        #[arg(long)]
        ceiling_gb: Option<f64>,

        /// Announce interval (e.g. "30s", "1m")
        #[arg(long, value_parser = duration_arg)]
        announce_interval: Option<Duration>,

        /// Silence after which a peer is pruned (e.g. "2m")
        #[arg(long, value_parser = duration_arg)]
        peer_timeout: Option<Duration>,

        /// Keep state in memory only
        #[arg(long)]
        memory: bool,
    },

    /// Validate and print the effective configuration
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            peer_id,
            data_dir,
            ipfs_api,
            admin,
            target,
            ceiling_gb,
            announce_interval,
            peer_timeout,
            memory,
        } => {
            // File and environment first, CLI flags have priority
            let mut node_config = NodeConfig::load(config.as_deref())?;
            if peer_id.is_some() {
                node_config.peer_id = peer_id;
            }
            if let Some(data_dir) = data_dir {
                node_config.data_dir = data_dir;
            }
            if let Some(ipfs_api) = ipfs_api {
                node_config.ipfs_api = ipfs_api;
            }
            if admin.is_some() {
                node_config.admin_addr = admin;
            }
            if let Some(target) = target {
                node_config.target_replication_factor = target;
            }
            if ceiling_gb.is_some() {
                node_config.storage_ceiling_gb = ceiling_gb;
            }
            if let Some(interval) = announce_interval {
                node_config.announce_interval_secs = interval.as_secs().max(1);
            }
            if let Some(timeout) = peer_timeout {
                node_config.peer_timeout_secs = timeout.as_secs();
            }
            if memory {
                node_config.state_backend = StateBackend::Memory;
            }

            init_tracing(&node_config.log_level);
            tracing::info!("tnet {}", tnet::BUILD_INFO);

            let node = Node::from_config(node_config)?;
            node.serve().await?;
        }

        Commands::Config { config } => {
            let node_config = NodeConfig::load(config.as_deref())?;
            node_config.validate()?;
            println!("{}", serde_json::to_string_pretty(&node_config)?);
        }
    }

    Ok(())
}
