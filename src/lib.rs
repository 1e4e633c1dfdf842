//! # tnet
//!
//! Gossip-based replica placement for content-addressed storage nodes.
//!
//! Every node periodically announces its free capacity and the content it
//! holds on a shared broadcast channel. Each node folds the announcements it
//! hears into a local view of who holds what, and independently pins content
//! that falls below the target replication factor while it has room. Peers
//! that stop announcing are pruned, which drops their replicas from the view
//! and lets the remaining nodes re-replicate.
//!
//! There is no coordinator and no consensus: nodes converge on a shared view
//! through repeated, idempotent announcements.

#![allow(clippy::result_large_err)]
//!
//! ## Architecture
//!
//! ```text
//!            broadcast channel ("tnet-announce")
//!   ─────────────┬──────────────────────┬──────────────
//!                │ announce             │ deliver
//!        ┌───────┴──────┐        ┌──────▼───────┐
//!        │  Announcer   │        │   Ingestor   │
//!        └───────┬──────┘        └──────┬───────┘
//!                │ own holdings         │ peers, edges
//!        ┌───────▼──────────────────────▼───────┐
//!        │          Local State Store           │
//!        └───────▲──────────────────────▲───────┘
//!                │ counts, self edges   │ prune
//!        ┌───────┴──────┐        ┌──────┴───────┐
//!        │   Enforcer   │        │   Detector   │
//!        └───────┬──────┘        └──────────────┘
//!                │ pin
//!        ┌───────▼──────┐
//!        │ Content Store│  (Kubo)
//!        └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! tnet-node serve --config tnet.toml --admin 127.0.0.1:7070
//! ```
//!
//! ### Inspect it
//! ```bash
//! tnet status --node http://127.0.0.1:7070
//! tnet peers
//! tnet content --under-replicated
//! tnet content bafy...
//! ```

pub mod common;
pub mod content;
pub mod node;
pub mod ops;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use common::{Error, NodeConfig, Result};
pub use node::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
