//! Local state store
//!
//! Durable table of known peers, known content identifiers, and which peer
//! holds which identifier, as last observed through gossip. This is the only
//! state shared by the node's loops; every operation is atomic with respect
//! to every other one.
//!
//! Two backends are provided:
//! - [`MemoryStateStore`]: in-process tables, for tests and ephemeral nodes
//! - [`RocksStateStore`]: RocksDB column families with synchronous writes

pub mod memory;
pub mod rocks;

pub use memory::MemoryStateStore;
pub use rocks::RocksStateStore;

use crate::common::Result;
use serde::{Deserialize, Serialize};

/// A remote peer, as last heard from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub free_capacity_gb: f64,
    /// Local receive time of the peer's latest announcement (unix seconds)
    pub last_seen: u64,
}

/// A content identifier known to this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub content_id: String,
    /// Best-effort size; 0 when unknown
    pub declared_size_gb: f64,
    /// Last time any replica edge for this content was recorded (unix seconds)
    pub last_held_at: u64,
}

/// "peer_id holds content_id", as last observed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaEdge {
    pub content_id: String,
    pub peer_id: String,
}

/// Local state store operations
///
/// Upserts are idempotent: re-applying identical input leaves the observable
/// state unchanged. Replica counts are always derived from current edges.
pub trait StateStore: Send + Sync {
    /// Peer id of the local node (never stored as a `PeerRecord`)
    fn local_peer_id(&self) -> &str;

    fn upsert_peer(&self, peer_id: &str, free_capacity_gb: f64, seen_at: u64) -> Result<()>;

    /// Create the record if unseen; fills in the size if it was unknown.
    fn upsert_content(&self, content_id: &str, size_gb: f64) -> Result<()>;

    /// Record that `peer_id` holds `content_id`. The peer must be the local
    /// node or a known peer; unknown content is created with size 0.
    fn upsert_replica_edge(&self, content_id: &str, peer_id: &str) -> Result<()>;

    /// Apply one peer announcement (peer, content records and edges) as a
    /// single atomic step.
    fn apply_announcement(
        &self,
        peer_id: &str,
        free_capacity_gb: f64,
        seen_at: u64,
        content_ids: &[String],
    ) -> Result<()>;

    /// Every known content id with its current replica count, ascending by id.
    fn list_content_with_replica_counts(&self) -> Result<Vec<(String, usize)>>;

    /// Peers whose `last_seen` is strictly before `cutoff`.
    fn list_stale_peers(&self, cutoff: u64) -> Result<Vec<String>>;

    /// Remove a peer and every replica edge naming it. Returns the number of
    /// edges removed; deleting an unknown peer is a no-op.
    fn delete_peer_and_cascade(&self, peer_id: &str) -> Result<usize>;

    /// Like [`delete_peer_and_cascade`](Self::delete_peer_and_cascade), but
    /// only while the peer's `last_seen` is still strictly before `cutoff`,
    /// checked in the same atomic step as the delete. Returns the number of
    /// edges removed, or `None` when the peer is unknown or was seen again.
    fn delete_peer_if_stale(&self, peer_id: &str, cutoff: u64) -> Result<Option<usize>>;

    /// Remove content records with no replica edges whose `last_held_at` is
    /// strictly before `cutoff`. Returns the number of records removed.
    fn compact_orphaned_content(&self, cutoff: u64) -> Result<usize>;

    fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>>;

    fn list_peers(&self) -> Result<Vec<PeerRecord>>;

    fn get_content(&self, content_id: &str) -> Result<Option<ContentRecord>>;

    /// Peers (possibly including the local node) holding `content_id`.
    fn holders_of(&self, content_id: &str) -> Result<Vec<String>>;

    fn replica_count(&self, content_id: &str) -> Result<usize> {
        Ok(self.holders_of(content_id)?.len())
    }
}

/// Clamp a capacity or size figure to a finite, non-negative value
pub(crate) fn sanitize_gb(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Merge an incoming size into an existing content record.
///
/// Returns the record to write, or `None` when nothing changes.
pub(crate) fn merge_content(
    existing: Option<&ContentRecord>,
    content_id: &str,
    size_gb: f64,
    now: u64,
) -> Option<ContentRecord> {
    let size_gb = sanitize_gb(size_gb);
    match existing {
        None => Some(ContentRecord {
            content_id: content_id.to_string(),
            declared_size_gb: size_gb,
            last_held_at: now,
        }),
        Some(record) if record.declared_size_gb == 0.0 && size_gb > 0.0 => Some(ContentRecord {
            declared_size_gb: size_gb,
            ..record.clone()
        }),
        Some(_) => None,
    }
}
