//! Capacity estimation
//!
//! Available capacity is `min(free disk, ceiling - used by local content)`,
//! clamped at zero. Per-object size failures count as zero usage, so a flaky
//! stat under-counts usage rather than starving the pin path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::common::bytes_to_gb;
use crate::content::ContentStore;

/// One capacity measurement
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityReport {
    /// Size in bytes of each held object (0 when its size query failed)
    pub sizes: BTreeMap<String, u64>,
    pub used_gb: f64,
    pub free_disk_gb: f64,
    pub available_gb: f64,
}

/// Running capacity figures for one enforcement pass
///
/// Measured once, then adjusted after each pin instead of re-measuring every
/// held object.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityBudget {
    pub used_gb: f64,
    pub free_disk_gb: f64,
    storage_ceiling_gb: Option<f64>,
}

impl CapacityBudget {
    pub fn available_gb(&self) -> f64 {
        available_gb(self.free_disk_gb, self.storage_ceiling_gb, self.used_gb)
    }
}

pub struct CapacityEstimator {
    content: Arc<dyn ContentStore>,
    storage_ceiling_gb: Option<f64>,
}

impl CapacityEstimator {
    pub fn new(content: Arc<dyn ContentStore>, storage_ceiling_gb: Option<f64>) -> Self {
        Self {
            content,
            storage_ceiling_gb,
        }
    }

    /// Current usable capacity in GB; never fails and never negative
    pub async fn available_capacity(&self) -> f64 {
        self.budget().await.available_gb()
    }

    /// Measure everything held locally once
    pub async fn budget(&self) -> CapacityBudget {
        let held = match self.content.list_held().await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!("Could not enumerate local content, assuming none: {}", e);
                BTreeSet::new()
            }
        };
        let report = self.measure(&held).await;
        CapacityBudget {
            used_gb: report.used_gb,
            free_disk_gb: report.free_disk_gb,
            storage_ceiling_gb: self.storage_ceiling_gb,
        }
    }

    /// Charge a newly pinned object to `budget` and refresh free disk
    pub async fn account_pin(&self, budget: &mut CapacityBudget, content_id: &str) {
        budget.used_gb += bytes_to_gb(self.size_or_zero(content_id).await);
        budget.free_disk_gb = self.free_disk_gb().await;
    }

    async fn size_or_zero(&self, content_id: &str) -> u64 {
        match self.content.size_of(content_id).await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(content_id = %content_id, "Size query failed, counting as 0: {}", e);
                0
            }
        }
    }

    async fn free_disk_gb(&self) -> f64 {
        match self.content.free_disk_space().await {
            Ok(bytes) => bytes_to_gb(bytes),
            Err(e) => {
                tracing::warn!("Free disk query failed, assuming no space: {}", e);
                0.0
            }
        }
    }

    /// Measure capacity given the set of locally held objects
    pub async fn measure(&self, held: &BTreeSet<String>) -> CapacityReport {
        let mut sizes = BTreeMap::new();
        for content_id in held {
            sizes.insert(content_id.clone(), self.size_or_zero(content_id).await);
        }
        let used_gb = bytes_to_gb(sizes.values().sum());
        let free_disk_gb = self.free_disk_gb().await;

        CapacityReport {
            available_gb: available_gb(free_disk_gb, self.storage_ceiling_gb, used_gb),
            sizes,
            used_gb,
            free_disk_gb,
        }
    }
}

/// `min(free_disk, ceiling - used)`, clamped to a finite non-negative value
pub fn available_gb(free_disk_gb: f64, storage_ceiling_gb: Option<f64>, used_gb: f64) -> f64 {
    let headroom = storage_ceiling_gb.map_or(f64::INFINITY, |ceiling| ceiling - used_gb);
    let available = free_disk_gb.min(headroom);
    if available.is_finite() && available > 0.0 {
        available
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_available_gb() {
        assert_eq!(available_gb(100.0, None, 40.0), 100.0);
        assert_eq!(available_gb(100.0, Some(50.0), 40.0), 10.0);
        assert_eq!(available_gb(5.0, Some(50.0), 40.0), 5.0);
        // usage above the ceiling clamps to zero
        assert_eq!(available_gb(100.0, Some(30.0), 40.0), 0.0);
        assert_eq!(available_gb(f64::NAN, None, 0.0), 0.0);
    }

    #[tokio::test]
    async fn test_ceiling_bounds_capacity() {
        let store = Arc::new(MemoryContentStore::standalone(500 * GB));
        store.insert("cid-a", 3 * GB).unwrap();
        store.insert("cid-b", GB).unwrap();

        let estimator = CapacityEstimator::new(store.clone(), Some(10.0));
        assert_eq!(estimator.available_capacity().await, 6.0);

        let unbounded = CapacityEstimator::new(store, None);
        assert_eq!(unbounded.available_capacity().await, 500.0);
    }

    #[tokio::test]
    async fn test_full_ceiling_is_zero() {
        let store = Arc::new(MemoryContentStore::standalone(500 * GB));
        store.insert("cid-a", 12 * GB).unwrap();

        let estimator = CapacityEstimator::new(store, Some(10.0));
        assert_eq!(estimator.available_capacity().await, 0.0);
    }

    #[tokio::test]
    async fn test_failed_size_counts_as_zero() {
        let store = Arc::new(MemoryContentStore::standalone(500 * GB));
        store.insert("cid-a", 4 * GB).unwrap();
        store.insert("cid-b", 2 * GB).unwrap();
        store.fail_size_for("cid-a").unwrap();

        let estimator = CapacityEstimator::new(store.clone(), Some(10.0));
        let held = store.list_held().await.unwrap();
        let report = estimator.measure(&held).await;

        assert_eq!(report.sizes.get("cid-a"), Some(&0));
        assert_eq!(report.used_gb, 2.0);
        assert_eq!(report.available_gb, 8.0);
    }

    #[tokio::test]
    async fn test_pin_is_charged_to_budget() {
        let store = Arc::new(MemoryContentStore::standalone(500 * GB));
        store.insert("cid-a", 3 * GB).unwrap();

        let estimator = CapacityEstimator::new(store.clone(), Some(10.0));
        let mut budget = estimator.budget().await;
        assert_eq!(budget.available_gb(), 7.0);

        store.insert("cid-b", 4 * GB).unwrap();
        store.set_free_disk(490 * GB);
        estimator.account_pin(&mut budget, "cid-b").await;
        assert_eq!(budget.used_gb, 7.0);
        assert_eq!(budget.free_disk_gb, 490.0);
        assert_eq!(budget.available_gb(), 3.0);
    }
}
