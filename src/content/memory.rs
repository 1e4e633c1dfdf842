//! In-process content store
//!
//! Objects live in a shared "network" map; pinning copies an object from the
//! network into the local set. Pin and size failures can be injected per id.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::ContentStore;
use crate::common::{Error, Result};

/// Objects fetchable by any `MemoryContentStore` sharing it (id → size in bytes)
pub type MemoryNetwork = Arc<Mutex<BTreeMap<String, u64>>>;

#[derive(Debug, Default)]
struct Inner {
    held: BTreeMap<String, u64>,
    failing_pins: HashSet<String>,
    failing_sizes: HashSet<String>,
}

#[derive(Debug)]
pub struct MemoryContentStore {
    network: MemoryNetwork,
    inner: Mutex<Inner>,
    free_disk: AtomicU64,
    pin_calls: AtomicUsize,
    size_calls: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new(network: MemoryNetwork, free_disk_bytes: u64) -> Self {
        Self {
            network,
            inner: Mutex::new(Inner::default()),
            free_disk: AtomicU64::new(free_disk_bytes),
            pin_calls: AtomicUsize::new(0),
            size_calls: AtomicUsize::new(0),
        }
    }

    /// A store with its own private network
    pub fn standalone(free_disk_bytes: u64) -> Self {
        Self::new(MemoryNetwork::default(), free_disk_bytes)
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::ContentStore("content store lock poisoned".into()))
    }

    fn network(&self) -> Result<MutexGuard<'_, BTreeMap<String, u64>>> {
        self.network
            .lock()
            .map_err(|_| Error::ContentStore("network lock poisoned".into()))
    }

    /// Store bytes locally, returning their content id
    pub fn add(&self, data: &[u8]) -> Result<String> {
        let content_id = blake3::hash(data).to_hex().to_string();
        self.insert(&content_id, data.len() as u64)?;
        Ok(content_id)
    }

    /// Hold an object of the given size locally and publish it to the network
    pub fn insert(&self, content_id: &str, size_bytes: u64) -> Result<()> {
        self.network()?.insert(content_id.to_string(), size_bytes);
        self.inner()?.held.insert(content_id.to_string(), size_bytes);
        Ok(())
    }

    pub fn set_free_disk(&self, bytes: u64) {
        self.free_disk.store(bytes, Ordering::SeqCst);
    }

    pub fn fail_pins_for(&self, content_id: &str) -> Result<()> {
        self.inner()?.failing_pins.insert(content_id.to_string());
        Ok(())
    }

    pub fn fail_size_for(&self, content_id: &str) -> Result<()> {
        self.inner()?.failing_sizes.insert(content_id.to_string());
        Ok(())
    }

    /// Number of `pin` calls made so far, successful or not
    pub fn pin_calls(&self) -> usize {
        self.pin_calls.load(Ordering::SeqCst)
    }

    /// Number of `size_of` calls made so far
    pub fn size_calls(&self) -> usize {
        self.size_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn list_held(&self) -> Result<BTreeSet<String>> {
        Ok(self.inner()?.held.keys().cloned().collect())
    }

    async fn size_of(&self, content_id: &str) -> Result<u64> {
        self.size_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner()?;
        if inner.failing_sizes.contains(content_id) {
            return Err(Error::ContentStore(format!("stat failed for {}", content_id)));
        }
        inner
            .held
            .get(content_id)
            .copied()
            .ok_or_else(|| Error::ContentNotFound(content_id.to_string()))
    }

    async fn pin(&self, content_id: &str) -> Result<()> {
        self.pin_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner()?.failing_pins.contains(content_id) {
            return Err(Error::Pin {
                content_id: content_id.to_string(),
                reason: "injected failure".into(),
            });
        }

        let size = self
            .network()?
            .get(content_id)
            .copied()
            .ok_or_else(|| Error::Pin {
                content_id: content_id.to_string(),
                reason: "no provider found".into(),
            })?;

        self.inner()?.held.insert(content_id.to_string(), size);
        self.free_disk
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |free| {
                Some(free.saturating_sub(size))
            })
            .ok();
        Ok(())
    }

    async fn free_disk_space(&self) -> Result<u64> {
        Ok(self.free_disk.load(Ordering::SeqCst))
    }
}
