//! In-memory state store

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::{merge_content, sanitize_gb, ContentRecord, PeerRecord, StateStore};
use crate::common::{timestamp_now, Error, Result};

#[derive(Debug, Default)]
struct Tables {
    peers: BTreeMap<String, PeerRecord>,
    content: BTreeMap<String, ContentRecord>,
    /// content_id -> holders
    replicas: BTreeMap<String, BTreeSet<String>>,
    /// peer_id -> held content
    holdings: BTreeMap<String, BTreeSet<String>>,
}

impl Tables {
    fn upsert_peer(&mut self, peer_id: &str, free_capacity_gb: f64, seen_at: u64) {
        self.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                free_capacity_gb: sanitize_gb(free_capacity_gb),
                last_seen: seen_at,
            },
        );
    }

    fn upsert_content(&mut self, content_id: &str, size_gb: f64, now: u64) {
        if let Some(record) = merge_content(self.content.get(content_id), content_id, size_gb, now) {
            self.content.insert(content_id.to_string(), record);
        }
    }

    fn upsert_edge(&mut self, content_id: &str, peer_id: &str, now: u64) {
        self.upsert_content(content_id, 0.0, now);
        if let Some(record) = self.content.get_mut(content_id) {
            record.last_held_at = record.last_held_at.max(now);
        }
        self.replicas
            .entry(content_id.to_string())
            .or_default()
            .insert(peer_id.to_string());
        self.holdings
            .entry(peer_id.to_string())
            .or_default()
            .insert(content_id.to_string());
    }

    /// Remove a peer and its edges, returning the number of edges removed
    fn remove_peer(&mut self, peer_id: &str) -> usize {
        self.peers.remove(peer_id);
        let held = self.holdings.remove(peer_id).unwrap_or_default();
        for content_id in &held {
            if let Some(holders) = self.replicas.get_mut(content_id) {
                holders.remove(peer_id);
                if holders.is_empty() {
                    self.replicas.remove(content_id);
                }
            }
        }
        held.len()
    }

    fn count(&self, content_id: &str) -> usize {
        self.replicas.get(content_id).map_or(0, BTreeSet::len)
    }
}

/// State store kept entirely in process memory
///
/// Writes are "durable" for the lifetime of the process only.
#[derive(Debug)]
pub struct MemoryStateStore {
    local_peer_id: String,
    tables: Mutex<Tables>,
}

impl MemoryStateStore {
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            tables: Mutex::new(Tables::default()),
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Store("state tables lock poisoned".into()))
    }

    fn reject_self(&self, peer_id: &str) -> Result<()> {
        if peer_id == self.local_peer_id {
            return Err(Error::SelfReference(peer_id.to_string()));
        }
        Ok(())
    }
}

impl StateStore for MemoryStateStore {
    fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    fn upsert_peer(&self, peer_id: &str, free_capacity_gb: f64, seen_at: u64) -> Result<()> {
        self.reject_self(peer_id)?;
        self.tables()?.upsert_peer(peer_id, free_capacity_gb, seen_at);
        Ok(())
    }

    fn upsert_content(&self, content_id: &str, size_gb: f64) -> Result<()> {
        self.tables()?.upsert_content(content_id, size_gb, timestamp_now());
        Ok(())
    }

    fn upsert_replica_edge(&self, content_id: &str, peer_id: &str) -> Result<()> {
        let mut tables = self.tables()?;
        if peer_id != self.local_peer_id && !tables.peers.contains_key(peer_id) {
            return Err(Error::UnknownPeer(peer_id.to_string()));
        }
        tables.upsert_edge(content_id, peer_id, timestamp_now());
        Ok(())
    }

    fn apply_announcement(
        &self,
        peer_id: &str,
        free_capacity_gb: f64,
        seen_at: u64,
        content_ids: &[String],
    ) -> Result<()> {
        self.reject_self(peer_id)?;
        let mut tables = self.tables()?;
        tables.upsert_peer(peer_id, free_capacity_gb, seen_at);
        for content_id in content_ids {
            tables.upsert_edge(content_id, peer_id, seen_at);
        }
        Ok(())
    }

    fn list_content_with_replica_counts(&self) -> Result<Vec<(String, usize)>> {
        let tables = self.tables()?;
        Ok(tables
            .content
            .keys()
            .map(|id| (id.clone(), tables.count(id)))
            .collect())
    }

    fn list_stale_peers(&self, cutoff: u64) -> Result<Vec<String>> {
        Ok(self
            .tables()?
            .peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.peer_id.clone())
            .collect())
    }

    fn delete_peer_and_cascade(&self, peer_id: &str) -> Result<usize> {
        self.reject_self(peer_id)?;
        Ok(self.tables()?.remove_peer(peer_id))
    }

    fn delete_peer_if_stale(&self, peer_id: &str, cutoff: u64) -> Result<Option<usize>> {
        self.reject_self(peer_id)?;
        let mut tables = self.tables()?;
        match tables.peers.get(peer_id) {
            Some(peer) if peer.last_seen < cutoff => Ok(Some(tables.remove_peer(peer_id))),
            _ => Ok(None),
        }
    }

    fn compact_orphaned_content(&self, cutoff: u64) -> Result<usize> {
        let mut tables = self.tables()?;
        let orphaned: Vec<String> = tables
            .content
            .values()
            .filter(|c| c.last_held_at < cutoff)
            .map(|c| c.content_id.clone())
            .filter(|id| tables.count(id) == 0)
            .collect();

        for content_id in &orphaned {
            tables.content.remove(content_id);
        }
        Ok(orphaned.len())
    }

    fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>> {
        Ok(self.tables()?.peers.get(peer_id).cloned())
    }

    fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.tables()?.peers.values().cloned().collect())
    }

    fn get_content(&self, content_id: &str) -> Result<Option<ContentRecord>> {
        Ok(self.tables()?.content.get(content_id).cloned())
    }

    fn holders_of(&self, content_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tables()?
            .replicas
            .get(content_id)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default())
    }
}
