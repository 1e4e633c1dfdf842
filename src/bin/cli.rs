//! CLI for inspecting a running node

use clap::{Parser, Subcommand};
use tnet::common::format_bytes;
use tnet::ops::{content_detail, list_content, list_peers, node_status};

#[derive(Parser)]
#[command(name = "tnet")]
#[command(about = "tnet node inspection CLI")]
#[command(version)]
struct Cli {
    /// Node admin API URL
    #[arg(long, default_value = "http://127.0.0.1:7070")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node health and replication summary
    Status,

    /// List known peers
    Peers,

    /// List tracked content, or show the holders of one content id
    Content {
        /// Content ID
        content_id: Option<String>,

        /// Only content below the target replication factor
        #[arg(long)]
        under_replicated: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let status = node_status(&cli.node).await?;
            println!("Node {} (v{})", status.health.peer_id, status.health.version);
            println!("  Uptime: {}s", status.health.uptime_secs);
            println!("  Known peers: {}", status.stats.known_peers);
            println!("  Known content: {}", status.stats.known_content);
            println!(
                "  Under-replicated: {} (target {})",
                status.stats.under_replicated, status.stats.target_replication_factor
            );
            println!(
                "  Available capacity: {:.2} GB",
                status.stats.available_capacity_gb
            );
            println!(
                "  Network free capacity: {:.2} GB",
                status.stats.network_free_capacity_gb
            );
        }

        Commands::Peers => {
            let peers = list_peers(&cli.node).await?;
            println!("{} peer(s)", peers.len());
            for peer in peers {
                let free_bytes = (peer.free_capacity_gb * 1024.0 * 1024.0 * 1024.0) as u64;
                println!(
                    "  {}  free {}  last seen {}",
                    peer.peer_id,
                    format_bytes(free_bytes),
                    peer.last_seen
                );
            }
        }

        Commands::Content {
            content_id: Some(content_id),
            ..
        } => {
            let detail = content_detail(&cli.node, &content_id).await?;
            println!("{}", detail.content_id);
            println!("  Declared size: {:.3} GB", detail.declared_size_gb);
            println!("  Last held at: {}", detail.last_held_at);
            println!("  Holders ({}):", detail.holders.len());
            for holder in detail.holders {
                println!("    {}", holder);
            }
        }

        Commands::Content {
            content_id: None,
            under_replicated,
        } => {
            let content = list_content(&cli.node, under_replicated).await?;
            println!("{} content id(s)", content.len());
            for entry in content {
                let marker = if entry.under_replicated { " (under-replicated)" } else { "" };
                println!("  {}  replicas {}{}", entry.content_id, entry.replicas, marker);
            }
        }
    }

    Ok(())
}
