//! Broadcast transport collaborator
//!
//! An unordered, best-effort publish/subscribe primitive over named channels.
//! Duplicates and reordering are possible; consumers must be idempotent.
//!
//! - [`IpfsPubsub`]: Kubo pubsub over the RPC API
//! - [`LocalBus`]: in-process fan-out for tests and simulations

pub mod ipfs_pubsub;
pub mod local;

pub use ipfs_pubsub::IpfsPubsub;
pub use local::{LocalBus, LocalTransport};

use crate::common::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Depth of the per-subscription delivery queue
pub const SUBSCRIPTION_BUFFER: usize = 1024;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` to every subscriber of `channel`.
    ///
    /// Fails with `Error::Transport` when the send fails; nothing is retried.
    async fn broadcast(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Receive every message delivered on `channel`, once per local delivery.
    ///
    /// The receiver yields `None` once the subscription can no longer deliver.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>>;
}
