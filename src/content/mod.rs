//! Content store collaborator
//!
//! The node never touches object bytes itself; it asks the content store what
//! is held locally, how large it is, and to pin (fetch and keep) objects.
//!
//! - [`IpfsContentStore`]: a Kubo daemon over its RPC API
//! - [`MemoryContentStore`]: in-process store for tests and simulations

pub mod ipfs;
pub mod memory;

pub use ipfs::IpfsContentStore;
pub use memory::MemoryContentStore;

use crate::common::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Content ids currently held (pinned) locally
    async fn list_held(&self) -> Result<BTreeSet<String>>;

    /// Size of a held object in bytes
    async fn size_of(&self, content_id: &str) -> Result<u64>;

    /// Fetch and keep `content_id` locally
    async fn pin(&self, content_id: &str) -> Result<()>;

    /// Free bytes on the disk backing the store
    async fn free_disk_space(&self) -> Result<u64>;

    /// Whether `content_id` is held locally
    async fn holds(&self, content_id: &str) -> Result<bool> {
        Ok(self.list_held().await?.contains(content_id))
    }
}
