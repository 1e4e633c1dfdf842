//! State store using RocksDB
//!
//! Column families:
//! - `peers`: peer_id → PeerRecord
//! - `content`: content_id → ContentRecord
//! - `replicas`: content_id \0 peer_id → ()
//! - `holdings`: peer_id \0 content_id → () (reverse index for cascades)
//!
//! Every operation writes one `WriteBatch` with `sync = true`, so a write is
//! on disk before the call returns. A store-wide mutex serializes the
//! read-modify-write sequences and the multi-family reads.

use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{merge_content, sanitize_gb, ContentRecord, PeerRecord, StateStore};
use crate::common::{timestamp_now, Error, Result};

const CF_PEERS: &str = "peers";
const CF_CONTENT: &str = "content";
const CF_REPLICAS: &str = "replicas";
const CF_HOLDINGS: &str = "holdings";

const SEPARATOR: u8 = 0;

fn pair_key(first: &str, second: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(first.len() + second.len() + 1);
    key.extend_from_slice(first.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(second.as_bytes());
    key
}

fn prefix_key(first: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(first.len() + 1);
    key.extend_from_slice(first.as_bytes());
    key.push(SEPARATOR);
    key
}

fn split_pair_key(key: &[u8]) -> Result<(String, String)> {
    let pos = key
        .iter()
        .position(|b| *b == SEPARATOR)
        .ok_or_else(|| Error::StoreCorrupted("pair key without separator".into()))?;
    let first = std::str::from_utf8(&key[..pos])
        .map_err(|_| Error::StoreCorrupted("Invalid UTF-8 in key".into()))?;
    let second = std::str::from_utf8(&key[pos + 1..])
        .map_err(|_| Error::StoreCorrupted("Invalid UTF-8 in key".into()))?;
    Ok((first.to_string(), second.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Durable state store
pub struct RocksStateStore {
    db: DB,
    local_peer_id: String,
    lock: Mutex<()>,
}

impl RocksStateStore {
    /// Open or create the state store at `path`
    pub fn open(path: impl AsRef<Path>, local_peer_id: impl Into<String>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_PEERS, CF_CONTENT, CF_REPLICAS, CF_HOLDINGS],
        )?;

        Ok(Self {
            db,
            local_peer_id: local_peer_id.into(),
            lock: Mutex::new(()),
        })
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::Store("state store lock poisoned".into()))
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Store(format!("missing column family {}", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    /// Delete a peer and both directions of its edges in one batch.
    /// Callers hold the store lock.
    fn remove_peer(&self, peer_id: &str) -> Result<usize> {
        let held = self.scan_pairs(CF_HOLDINGS, peer_id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_PEERS)?, peer_id.as_bytes());
        for content_id in &held {
            batch.delete_cf(self.cf(CF_HOLDINGS)?, pair_key(peer_id, content_id));
            batch.delete_cf(self.cf(CF_REPLICAS)?, pair_key(content_id, peer_id));
        }
        self.write(batch)?;
        Ok(held.len())
    }

    fn reject_self(&self, peer_id: &str) -> Result<()> {
        if peer_id == self.local_peer_id {
            return Err(Error::SelfReference(peer_id.to_string()));
        }
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let iter = self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start);
        let mut out = Vec::new();
        for item in iter {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Second halves of every pair key in `cf` starting with `first`
    fn scan_pairs(&self, cf: &str, first: &str) -> Result<Vec<String>> {
        let prefix = prefix_key(first);
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(&prefix, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            out.push(split_pair_key(&key)?.1);
        }
        Ok(out)
    }

    /// Replica counts for every content id with at least one edge
    fn edge_counts(&self) -> Result<HashMap<String, usize>> {
        let iter = self
            .db
            .iterator_cf(self.cf(CF_REPLICAS)?, IteratorMode::Start);
        let mut counts = HashMap::new();
        for item in iter {
            let (key, _) = item?;
            let (content_id, _) = split_pair_key(&key)?;
            *counts.entry(content_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn batch_peer(&self, batch: &mut WriteBatch, record: &PeerRecord) -> Result<()> {
        batch.put_cf(self.cf(CF_PEERS)?, record.peer_id.as_bytes(), encode(record)?);
        Ok(())
    }

    /// Queue the writes for one edge; content record is created or refreshed.
    fn batch_edge(
        &self,
        batch: &mut WriteBatch,
        content_id: &str,
        peer_id: &str,
        now: u64,
    ) -> Result<()> {
        let existing: Option<ContentRecord> = self.read(CF_CONTENT, content_id.as_bytes())?;
        let record = match merge_content(existing.as_ref(), content_id, 0.0, now) {
            Some(created) => created,
            None => {
                let mut record = existing.ok_or_else(|| {
                    Error::Internal("content merge returned nothing for a missing record".into())
                })?;
                record.last_held_at = record.last_held_at.max(now);
                record
            }
        };
        batch.put_cf(self.cf(CF_CONTENT)?, content_id.as_bytes(), encode(&record)?);
        batch.put_cf(self.cf(CF_REPLICAS)?, pair_key(content_id, peer_id), b"");
        batch.put_cf(self.cf(CF_HOLDINGS)?, pair_key(peer_id, content_id), b"");
        Ok(())
    }
}

impl StateStore for RocksStateStore {
    fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    fn upsert_peer(&self, peer_id: &str, free_capacity_gb: f64, seen_at: u64) -> Result<()> {
        self.reject_self(peer_id)?;
        let _guard = self.guard()?;
        let mut batch = WriteBatch::default();
        self.batch_peer(
            &mut batch,
            &PeerRecord {
                peer_id: peer_id.to_string(),
                free_capacity_gb: sanitize_gb(free_capacity_gb),
                last_seen: seen_at,
            },
        )?;
        self.write(batch)
    }

    fn upsert_content(&self, content_id: &str, size_gb: f64) -> Result<()> {
        let _guard = self.guard()?;
        let existing: Option<ContentRecord> = self.read(CF_CONTENT, content_id.as_bytes())?;
        if let Some(record) = merge_content(existing.as_ref(), content_id, size_gb, timestamp_now())
        {
            let mut batch = WriteBatch::default();
            batch.put_cf(self.cf(CF_CONTENT)?, content_id.as_bytes(), encode(&record)?);
            self.write(batch)?;
        }
        Ok(())
    }

    fn upsert_replica_edge(&self, content_id: &str, peer_id: &str) -> Result<()> {
        let _guard = self.guard()?;
        if peer_id != self.local_peer_id
            && self.db.get_cf(self.cf(CF_PEERS)?, peer_id.as_bytes())?.is_none()
        {
            return Err(Error::UnknownPeer(peer_id.to_string()));
        }
        let mut batch = WriteBatch::default();
        self.batch_edge(&mut batch, content_id, peer_id, timestamp_now())?;
        self.write(batch)
    }

    fn apply_announcement(
        &self,
        peer_id: &str,
        free_capacity_gb: f64,
        seen_at: u64,
        content_ids: &[String],
    ) -> Result<()> {
        self.reject_self(peer_id)?;
        let _guard = self.guard()?;
        let mut batch = WriteBatch::default();
        self.batch_peer(
            &mut batch,
            &PeerRecord {
                peer_id: peer_id.to_string(),
                free_capacity_gb: sanitize_gb(free_capacity_gb),
                last_seen: seen_at,
            },
        )?;
        for content_id in content_ids {
            self.batch_edge(&mut batch, content_id, peer_id, seen_at)?;
        }
        self.write(batch)
    }

    fn list_content_with_replica_counts(&self) -> Result<Vec<(String, usize)>> {
        let _guard = self.guard()?;
        let counts = self.edge_counts()?;
        let iter = self
            .db
            .iterator_cf(self.cf(CF_CONTENT)?, IteratorMode::Start);

        let mut out = Vec::new();
        for item in iter {
            let (key, _) = item?;
            let content_id = String::from_utf8(key.to_vec())
                .map_err(|_| Error::StoreCorrupted("Invalid UTF-8".into()))?;
            let count = counts.get(&content_id).copied().unwrap_or(0);
            out.push((content_id, count));
        }
        Ok(out)
    }

    fn list_stale_peers(&self, cutoff: u64) -> Result<Vec<String>> {
        let _guard = self.guard()?;
        Ok(self
            .scan::<PeerRecord>(CF_PEERS)?
            .into_iter()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.peer_id)
            .collect())
    }

    fn delete_peer_and_cascade(&self, peer_id: &str) -> Result<usize> {
        self.reject_self(peer_id)?;
        let _guard = self.guard()?;
        self.remove_peer(peer_id)
    }

    fn delete_peer_if_stale(&self, peer_id: &str, cutoff: u64) -> Result<Option<usize>> {
        self.reject_self(peer_id)?;
        let _guard = self.guard()?;
        match self.read::<PeerRecord>(CF_PEERS, peer_id.as_bytes())? {
            Some(peer) if peer.last_seen < cutoff => Ok(Some(self.remove_peer(peer_id)?)),
            _ => Ok(None),
        }
    }

    fn compact_orphaned_content(&self, cutoff: u64) -> Result<usize> {
        let _guard = self.guard()?;
        let counts = self.edge_counts()?;
        let orphaned: Vec<ContentRecord> = self
            .scan::<ContentRecord>(CF_CONTENT)?
            .into_iter()
            .filter(|c| c.last_held_at < cutoff && !counts.contains_key(&c.content_id))
            .collect();

        if orphaned.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for record in &orphaned {
            batch.delete_cf(self.cf(CF_CONTENT)?, record.content_id.as_bytes());
        }
        self.write(batch)?;
        Ok(orphaned.len())
    }

    fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>> {
        let _guard = self.guard()?;
        self.read(CF_PEERS, peer_id.as_bytes())
    }

    fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        let _guard = self.guard()?;
        self.scan(CF_PEERS)
    }

    fn get_content(&self, content_id: &str) -> Result<Option<ContentRecord>> {
        let _guard = self.guard()?;
        self.read(CF_CONTENT, content_id.as_bytes())
    }

    fn holders_of(&self, content_id: &str) -> Result<Vec<String>> {
        let _guard = self.guard()?;
        self.scan_pairs(CF_REPLICAS, content_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::conformance;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_conformance() {
        let dir = tempdir().unwrap();
        let next = AtomicUsize::new(0);
        conformance::run_all(|| {
            let n = next.fetch_add(1, Ordering::SeqCst);
            Box::new(
                RocksStateStore::open(dir.path().join(format!("state-{}", n)), conformance::SELF_ID)
                    .unwrap(),
            )
        });
    }

    #[test]
    fn test_pair_keys() {
        let key = pair_key("bafy-cid", "peer-1");
        assert!(key.starts_with(&prefix_key("bafy-cid")));
        assert!(!key.starts_with(&prefix_key("bafy")));
        assert_eq!(
            split_pair_key(&key).unwrap(),
            ("bafy-cid".to_string(), "peer-1".to_string())
        );
        assert!(split_pair_key(b"no-separator").is_err());
    }

    #[test]
    fn test_prefix_scan_does_not_bleed() {
        let dir = tempdir().unwrap();
        let store = RocksStateStore::open(dir.path().join("state"), "self").unwrap();
        store
            .apply_announcement("peer", 1.0, 1, &["ab".to_string()])
            .unwrap();
        store
            .apply_announcement("peer-2", 1.0, 1, &["abc".to_string()])
            .unwrap();

        assert_eq!(store.holders_of("ab").unwrap(), vec!["peer".to_string()]);
        assert_eq!(store.delete_peer_and_cascade("peer").unwrap(), 1);
        assert_eq!(store.replica_count("abc").unwrap(), 1);
    }
}
