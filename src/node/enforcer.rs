//! Replication enforcement
//!
//! Each pass reads replica counts from the state store and pins every
//! under-replicated object this node does not already hold, as long as local
//! capacity remains. Capacity is measured once per pass, on the first
//! candidate that needs it, and each successful pin is charged against it
//! before the next candidate is checked.
//!
//! Content whose recorded size exceeds the remaining capacity is skipped.
//! Announcements carry no sizes, so content known only from other peers is
//! recorded with size 0 and always passes that check; it only applies to
//! sizes this node recorded itself while it held the content.
//!
//! Enforcement is uncoordinated: several peers may pin the same
//! object in the same window and overshoot the target. Nothing is ever
//! unpinned here.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backoff::RetryPolicy;
use super::capacity::{CapacityBudget, CapacityEstimator};
use super::{jittered_ticker, next_tick, Shutdown};
use crate::common::{timestamp_now, Error, NodeConfig, NodeMetrics, Result};
use crate::content::ContentStore;
use crate::state::StateStore;

#[derive(Debug, Clone)]
pub struct EnforcerSettings {
    pub target_replication_factor: usize,
    /// Visit candidates by ascending replica count instead of store order
    pub prioritize_scarce: bool,
    pub pin_timeout: Option<Duration>,
}

impl EnforcerSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            target_replication_factor: config.target_replication_factor,
            prioritize_scarce: config.prioritize_scarce,
            pin_timeout: config.pin_timeout(),
        }
    }
}

/// Tally of one enforcement pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnforcementReport {
    /// Content below the target replica count
    pub under_replicated: usize,
    pub pinned: usize,
    pub failed: usize,
    pub already_held: usize,
    pub skipped_capacity: usize,
    pub skipped_backoff: usize,
    /// Candidates skipped because the content store could not be queried
    pub skipped_unavailable: usize,
}

pub struct Enforcer {
    state: Arc<dyn StateStore>,
    content: Arc<dyn ContentStore>,
    estimator: Arc<CapacityEstimator>,
    retry: Box<dyn RetryPolicy>,
    metrics: Arc<NodeMetrics>,
    settings: EnforcerSettings,
    interval: Duration,
}

impl Enforcer {
    pub fn new(
        state: Arc<dyn StateStore>,
        content: Arc<dyn ContentStore>,
        estimator: Arc<CapacityEstimator>,
        retry: Box<dyn RetryPolicy>,
        metrics: Arc<NodeMetrics>,
        settings: EnforcerSettings,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            content,
            estimator,
            retry,
            metrics,
            settings,
            interval,
        }
    }

    /// Run one pass at `now`. Only state store failures are returned.
    pub async fn enforce_once(&self, now: u64) -> Result<EnforcementReport> {
        let started = Instant::now();
        let target = self.settings.target_replication_factor;
        let local = self.state.local_peer_id().to_string();

        let mut entries = self.state.list_content_with_replica_counts()?;
        self.metrics.known_content.set(entries.len() as u64);
        if self.settings.prioritize_scarce {
            // stable sort keeps id order among equal counts
            entries.sort_by_key(|(_, count)| *count);
        }

        let mut report = EnforcementReport::default();
        let mut budget: Option<CapacityBudget> = None;
        let mut candidates = BTreeSet::new();
        for (content_id, count) in entries {
            if count >= target {
                continue;
            }
            report.under_replicated += 1;

            match self.content.holds(&content_id).await {
                Ok(true) => {
                    report.already_held += 1;
                    continue;
                }
                Ok(false) => {
                    candidates.insert(content_id.clone());
                }
                Err(e) => {
                    tracing::warn!(content_id = %content_id, "Could not check local holdings: {}", e);
                    candidates.insert(content_id.clone());
                    report.skipped_unavailable += 1;
                    continue;
                }
            }

            if !self.retry.should_attempt(&content_id, now) {
                report.skipped_backoff += 1;
                continue;
            }

            if budget.is_none() {
                budget = Some(self.estimator.budget().await);
            }
            let available = budget.as_ref().map_or(0.0, CapacityBudget::available_gb);
            if available <= 0.0 {
                report.skipped_capacity += 1;
                continue;
            }
            if let Some(record) = self.state.get_content(&content_id)? {
                if record.declared_size_gb > available {
                    tracing::debug!(
                        content_id = %content_id,
                        size_gb = record.declared_size_gb,
                        available_gb = available,
                        "Content larger than available capacity"
                    );
                    report.skipped_capacity += 1;
                    continue;
                }
            }

            match self.pin(&content_id).await {
                Ok(()) => {
                    self.state.upsert_replica_edge(&content_id, &local)?;
                    if let Some(budget) = budget.as_mut() {
                        self.estimator.account_pin(budget, &content_id).await;
                    }
                    self.retry.record_success(&content_id);
                    self.metrics.pins_succeeded.inc();
                    report.pinned += 1;
                    tracing::info!(content_id = %content_id, replicas = count + 1, "Pinned replica");
                }
                Err(e) => {
                    self.retry.record_failure(&content_id, now);
                    self.metrics.pins_failed.inc();
                    report.failed += 1;
                    tracing::warn!(content_id = %content_id, "Pin failed: {}", e);
                }
            }
        }

        self.retry.retain(&candidates);
        self.metrics
            .under_replicated
            .set((report.under_replicated - report.pinned) as u64);
        self.metrics.enforcement_duration.observe(started.elapsed());
        Ok(report)
    }

    async fn pin(&self, content_id: &str) -> Result<()> {
        match self.settings.pin_timeout {
            Some(limit) => tokio::time::timeout(limit, self.content.pin(content_id))
                .await
                .map_err(|_| Error::Timeout(format!("pin {} exceeded {:?}", content_id, limit)))?,
            None => self.content.pin(content_id).await,
        }
    }

    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        // stagger the first pass across peers
        let mut interval = jittered_ticker(self.interval);
        tracing::info!(
            target_replication_factor = self.settings.target_replication_factor,
            "Enforcer started"
        );

        while next_tick(&mut interval, &mut shutdown).await {
            match self.enforce_once(timestamp_now()).await {
                Ok(report) if report.under_replicated > 0 => tracing::info!(
                    under_replicated = report.under_replicated,
                    pinned = report.pinned,
                    failed = report.failed,
                    skipped_capacity = report.skipped_capacity,
                    "Enforcement pass complete"
                ),
                Ok(_) => tracing::debug!("Enforcement pass complete, nothing to do"),
                Err(e) if e.is_fatal() => {
                    tracing::error!("Enforcer stopping on state store failure: {}", e);
                    return Err(e);
                }
                Err(e) => tracing::warn!("Enforcement pass failed: {}", e),
            }
        }

        tracing::info!("Enforcer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::memory::MemoryNetwork;
    use crate::content::MemoryContentStore;
    use crate::node::backoff::{ExponentialBackoff, RetryForever};
    use crate::state::MemoryStateStore;

    const GB: u64 = 1024 * 1024 * 1024;

    /// A local node plus a remote provider sharing one network
    struct Fixture {
        state: Arc<MemoryStateStore>,
        provider: MemoryContentStore,
        local: Arc<MemoryContentStore>,
        metrics: Arc<NodeMetrics>,
    }

    impl Fixture {
        fn new(free_disk: u64) -> Self {
            let network = MemoryNetwork::default();
            Self {
                state: Arc::new(MemoryStateStore::new("self")),
                provider: MemoryContentStore::new(network.clone(), 0),
                local: Arc::new(MemoryContentStore::new(network, free_disk)),
                metrics: Arc::new(NodeMetrics::new()),
            }
        }

        fn enforcer(&self, target: usize, prioritize_scarce: bool, retry: Box<dyn RetryPolicy>) -> Enforcer {
            let estimator = Arc::new(CapacityEstimator::new(self.local.clone(), None));
            Enforcer::new(
                self.state.clone(),
                self.local.clone(),
                estimator,
                retry,
                self.metrics.clone(),
                EnforcerSettings {
                    target_replication_factor: target,
                    prioritize_scarce,
                    pin_timeout: None,
                },
                Duration::from_secs(45),
            )
        }

        /// Publish `content_id` on the network and record remote holders
        fn publish(&self, content_id: &str, size: u64, holders: &[&str]) {
            self.provider.insert(content_id, size).unwrap();
            for peer_id in holders {
                self.state
                    .apply_announcement(peer_id, 10.0, 100, &[content_id.to_string()])
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_pin_records_self_edge() {
        let f = Fixture::new(100 * GB);
        f.publish("cidX", GB, &["A"]);
        let enforcer = f.enforcer(2, false, Box::new(RetryForever));

        let report = enforcer.enforce_once(200).await.unwrap();
        assert_eq!(report.under_replicated, 1);
        assert_eq!(report.pinned, 1);
        assert_eq!(f.state.replica_count("cidX").unwrap(), 2);
        assert!(f.state.holders_of("cidX").unwrap().contains(&"self".to_string()));
        assert_eq!(f.metrics.pins_succeeded.get(), 1);
        assert_eq!(f.metrics.under_replicated.get(), 0);

        // target reached: the next pass does nothing
        let report = enforcer.enforce_once(300).await.unwrap();
        assert_eq!(report.under_replicated, 0);
        assert_eq!(f.local.pin_calls(), 1);
    }

    #[tokio::test]
    async fn test_skips_content_already_held() {
        let f = Fixture::new(100 * GB);
        f.publish("cidX", GB, &["A"]);
        // held locally but the announcer has not recorded it yet
        f.local.insert("cidX", GB).unwrap();

        let report = f.enforcer(3, false, Box::new(RetryForever)).enforce_once(200).await.unwrap();
        assert_eq!(report.already_held, 1);
        assert_eq!(f.local.pin_calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_means_zero_pins() {
        let f = Fixture::new(0);
        f.publish("cidX", GB, &["A"]);
        f.publish("cidY", GB, &["B"]);

        let report = f.enforcer(3, false, Box::new(RetryForever)).enforce_once(200).await.unwrap();
        assert_eq!(report.under_replicated, 2);
        assert_eq!(report.skipped_capacity, 2);
        assert_eq!(f.local.pin_calls(), 0);
        assert_eq!(f.metrics.under_replicated.get(), 2);
    }

    #[tokio::test]
    async fn test_skips_content_larger_than_capacity() {
        let f = Fixture::new(10 * GB);
        f.publish("big", 50 * GB, &["A"]);
        f.state.upsert_content("big", 50.0).unwrap();

        let report = f.enforcer(2, false, Box::new(RetryForever)).enforce_once(200).await.unwrap();
        assert_eq!(report.skipped_capacity, 1);
        assert_eq!(f.local.pin_calls(), 0);
    }

    #[tokio::test]
    async fn test_capacity_is_remeasured_between_pins() {
        // room for exactly one of two 1 GB objects
        let f = Fixture::new(GB);
        f.publish("cid-a", GB, &["A", "B"]);
        f.publish("cid-b", GB, &["A"]);

        let report = f.enforcer(3, false, Box::new(RetryForever)).enforce_once(200).await.unwrap();
        assert_eq!(report.pinned, 1);
        assert_eq!(report.skipped_capacity, 1);
        // store order: cid-a first
        assert!(f.local.holds("cid-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_scarce_content_first() {
        let f = Fixture::new(GB);
        f.publish("cid-a", GB, &["A", "B"]);
        f.publish("cid-b", GB, &["A"]);

        let report = f.enforcer(3, true, Box::new(RetryForever)).enforce_once(200).await.unwrap();
        assert_eq!(report.pinned, 1);
        assert!(f.local.holds("cid-b").await.unwrap());
        assert!(!f.local.holds("cid-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_measured_once_per_pass() {
        let f = Fixture::new(1000 * GB);
        for i in 0..50 {
            f.local.insert(&format!("held-{}", i), GB).unwrap();
        }
        for i in 0..50 {
            f.state
                .apply_announcement("A", 50.0, 100, &[format!("wanted-{}", i)])
                .unwrap();
        }

        let report = f.enforcer(2, false, Box::new(RetryForever)).enforce_once(200).await.unwrap();
        assert_eq!(report.under_replicated, 50);
        assert_eq!(report.failed, 50);
        // one size query per held object, none per candidate
        assert_eq!(f.local.size_calls(), 50);
    }

    #[tokio::test]
    async fn test_successful_pins_use_up_the_budget() {
        let f = Fixture::new(3 * GB);
        f.publish("cid-a", 2 * GB, &["A"]);
        f.publish("cid-b", 2 * GB, &["A"]);
        f.publish("cid-c", GB, &["A"]);

        // sizes are unknown here, so only the running free disk gates:
        // 3 GB free, then 1 GB after cid-a, then none after cid-b
        let report = f.enforcer(2, false, Box::new(RetryForever)).enforce_once(200).await.unwrap();
        assert_eq!(report.pinned, 2);
        assert_eq!(report.skipped_capacity, 1);
        assert!(!f.local.holds("cid-c").await.unwrap());
        // nothing was held at the start; one size query per pin
        assert_eq!(f.local.size_calls(), 2);
    }

    #[tokio::test]
    async fn test_backoff_forgets_content_that_recovered() {
        let f = Fixture::new(100 * GB);
        f.state
            .apply_announcement("A", 50.0, 100, &["missing".to_string()])
            .unwrap();
        let policy = Arc::new(ExponentialBackoff::new(60, 600));
        let enforcer = f.enforcer(2, false, Box::new(policy.clone()));

        assert_eq!(enforcer.enforce_once(200).await.unwrap().failed, 1);
        assert_eq!(policy.tracked(), 1);

        // another peer picks it up, so it is no longer a candidate here
        f.state
            .apply_announcement("B", 50.0, 210, &["missing".to_string()])
            .unwrap();
        assert_eq!(enforcer.enforce_once(220).await.unwrap().under_replicated, 0);
        assert_eq!(policy.tracked(), 0);
    }

    #[tokio::test]
    async fn test_failed_pin_retries_per_policy() {
        let f = Fixture::new(100 * GB);
        // announced but fetchable from nowhere
        f.state
            .apply_announcement("A", 50.0, 100, &["missing".to_string()])
            .unwrap();

        let forever = f.enforcer(2, false, Box::new(RetryForever));
        assert_eq!(forever.enforce_once(200).await.unwrap().failed, 1);
        assert_eq!(forever.enforce_once(201).await.unwrap().failed, 1);
        assert_eq!(f.local.pin_calls(), 2);
        assert_eq!(f.state.replica_count("missing").unwrap(), 1);

        let backoff = f.enforcer(2, false, Box::new(ExponentialBackoff::new(60, 600)));
        assert_eq!(backoff.enforce_once(200).await.unwrap().failed, 1);
        assert_eq!(backoff.enforce_once(230).await.unwrap().skipped_backoff, 1);
        assert_eq!(backoff.enforce_once(260).await.unwrap().failed, 1);
        assert_eq!(f.metrics.pins_failed.get(), 4);
    }
}
