//! Failure detection
//!
//! A peer silent for longer than `peer_timeout_secs` is pruned along with its
//! replica edges, which lowers the replica counts the enforcer sees.

use std::sync::Arc;
use std::time::Duration;

use super::{next_tick, ticker, Shutdown};
use crate::common::{timestamp_now, NodeMetrics, Result};
use crate::state::StateStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub peers_pruned: usize,
    pub edges_removed: usize,
    pub content_compacted: usize,
}

pub struct FailureDetector {
    state: Arc<dyn StateStore>,
    metrics: Arc<NodeMetrics>,
    peer_timeout_secs: u64,
    content_ttl_secs: Option<u64>,
    interval: Duration,
}

impl FailureDetector {
    pub fn new(
        state: Arc<dyn StateStore>,
        metrics: Arc<NodeMetrics>,
        peer_timeout_secs: u64,
        content_ttl_secs: Option<u64>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            metrics,
            peer_timeout_secs,
            content_ttl_secs,
            interval,
        }
    }

    /// Prune every peer last seen before `now - peer_timeout_secs`
    pub fn prune_once(&self, now: u64) -> Result<PruneReport> {
        let cutoff = now.saturating_sub(self.peer_timeout_secs);
        let mut report = PruneReport::default();

        for peer_id in self.state.list_stale_peers(cutoff)? {
            // an announcement may land between the scan and the delete
            let Some(edges) = self.state.delete_peer_if_stale(&peer_id, cutoff)? else {
                tracing::debug!(peer_id = %peer_id, "Peer announced again, not pruned");
                continue;
            };
            tracing::info!(peer_id = %peer_id, edges, "Pruned silent peer");
            report.peers_pruned += 1;
            report.edges_removed += edges;
        }

        if let Some(ttl) = self.content_ttl_secs {
            report.content_compacted = self
                .state
                .compact_orphaned_content(now.saturating_sub(ttl))?;
            if report.content_compacted > 0 {
                tracing::info!(count = report.content_compacted, "Compacted orphaned content");
            }
        }

        self.metrics.peers_pruned.add(report.peers_pruned as u64);
        self.metrics.edges_pruned.add(report.edges_removed as u64);
        self.metrics
            .content_compacted
            .add(report.content_compacted as u64);
        self.metrics
            .known_peers
            .set(self.state.list_peers()?.len() as u64);

        Ok(report)
    }

    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        let mut interval = ticker(self.interval);
        tracing::info!(peer_timeout_secs = self.peer_timeout_secs, "Failure detector started");

        while next_tick(&mut interval, &mut shutdown).await {
            if let Err(e) = self.prune_once(timestamp_now()) {
                if e.is_fatal() {
                    tracing::error!("Failure detector stopping on state store failure: {}", e);
                    return Err(e);
                }
                tracing::warn!("Prune pass failed: {}", e);
            }
        }

        tracing::info!("Failure detector stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ContentRecord, MemoryStateStore, PeerRecord};

    /// Delivers a fresh announcement from `peer_id` right after every stale scan
    struct AnnouncesAfterScan {
        inner: MemoryStateStore,
        peer_id: String,
        seen_at: u64,
    }

    impl StateStore for AnnouncesAfterScan {
        fn local_peer_id(&self) -> &str {
            self.inner.local_peer_id()
        }
        fn upsert_peer(&self, peer_id: &str, free_capacity_gb: f64, seen_at: u64) -> Result<()> {
            self.inner.upsert_peer(peer_id, free_capacity_gb, seen_at)
        }
        fn upsert_content(&self, content_id: &str, size_gb: f64) -> Result<()> {
            self.inner.upsert_content(content_id, size_gb)
        }
        fn upsert_replica_edge(&self, content_id: &str, peer_id: &str) -> Result<()> {
            self.inner.upsert_replica_edge(content_id, peer_id)
        }
        fn apply_announcement(
            &self,
            peer_id: &str,
            free_capacity_gb: f64,
            seen_at: u64,
            content_ids: &[String],
        ) -> Result<()> {
            self.inner
                .apply_announcement(peer_id, free_capacity_gb, seen_at, content_ids)
        }
        fn list_content_with_replica_counts(&self) -> Result<Vec<(String, usize)>> {
            self.inner.list_content_with_replica_counts()
        }
        fn list_stale_peers(&self, cutoff: u64) -> Result<Vec<String>> {
            let stale = self.inner.list_stale_peers(cutoff)?;
            self.inner
                .apply_announcement(&self.peer_id, 10.0, self.seen_at, &ids(&["cidX"]))?;
            Ok(stale)
        }
        fn delete_peer_and_cascade(&self, peer_id: &str) -> Result<usize> {
            self.inner.delete_peer_and_cascade(peer_id)
        }
        fn delete_peer_if_stale(&self, peer_id: &str, cutoff: u64) -> Result<Option<usize>> {
            self.inner.delete_peer_if_stale(peer_id, cutoff)
        }
        fn compact_orphaned_content(&self, cutoff: u64) -> Result<usize> {
            self.inner.compact_orphaned_content(cutoff)
        }
        fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>> {
            self.inner.get_peer(peer_id)
        }
        fn list_peers(&self) -> Result<Vec<PeerRecord>> {
            self.inner.list_peers()
        }
        fn get_content(&self, content_id: &str) -> Result<Option<ContentRecord>> {
            self.inner.get_content(content_id)
        }
        fn holders_of(&self, content_id: &str) -> Result<Vec<String>> {
            self.inner.holders_of(content_id)
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn detector(state: Arc<MemoryStateStore>, ttl: Option<u64>) -> FailureDetector {
        FailureDetector::new(state, Arc::new(NodeMetrics::new()), 120, ttl, Duration::from_secs(45))
    }

    #[test]
    fn test_prunes_silent_peers_with_edges() {
        let state = Arc::new(MemoryStateStore::new("self"));
        state.apply_announcement("A", 10.0, 100, &ids(&["cidX", "cidY"])).unwrap();
        state.apply_announcement("B", 10.0, 200, &ids(&["cidX"])).unwrap();

        let detector = detector(state.clone(), None);
        // cutoff 100: A is not strictly older yet
        assert_eq!(detector.prune_once(220).unwrap(), PruneReport::default());

        let report = detector.prune_once(221).unwrap();
        assert_eq!(report.peers_pruned, 1);
        assert_eq!(report.edges_removed, 2);
        assert!(state.get_peer("A").unwrap().is_none());
        assert_eq!(
            state.list_content_with_replica_counts().unwrap(),
            vec![("cidX".to_string(), 1), ("cidY".to_string(), 0)]
        );
        assert_eq!(detector.metrics.known_peers.get(), 1);
    }

    #[test]
    fn test_reannounced_peer_survives() {
        let state = Arc::new(MemoryStateStore::new("self"));
        state.apply_announcement("A", 10.0, 100, &ids(&["cidX"])).unwrap();
        state.apply_announcement("A", 10.0, 200, &ids(&["cidX"])).unwrap();

        let report = detector(state.clone(), None).prune_once(250).unwrap();
        assert_eq!(report.peers_pruned, 0);
        assert_eq!(state.replica_count("cidX").unwrap(), 1);
    }

    #[test]
    fn test_compaction_is_opt_in() {
        let state = Arc::new(MemoryStateStore::new("self"));
        state.apply_announcement("A", 10.0, 100, &ids(&["cidX"])).unwrap();

        let report = detector(state.clone(), None).prune_once(10_000).unwrap();
        assert_eq!(report.content_compacted, 0);
        assert!(state.get_content("cidX").unwrap().is_some());

        let report = detector(state.clone(), Some(3600)).prune_once(10_000).unwrap();
        assert_eq!(report.content_compacted, 1);
        assert!(state.get_content("cidX").unwrap().is_none());
    }

    #[test]
    fn test_peer_announcing_during_prune_is_kept() {
        let inner = MemoryStateStore::new("self");
        inner.apply_announcement("A", 10.0, 100, &ids(&["cidX"])).unwrap();
        let state = Arc::new(AnnouncesAfterScan {
            inner,
            peer_id: "A".into(),
            seen_at: 900,
        });

        let detector = FailureDetector::new(
            state.clone(),
            Arc::new(NodeMetrics::new()),
            120,
            None,
            Duration::from_secs(45),
        );
        let report = detector.prune_once(400).unwrap();
        assert_eq!(report.peers_pruned, 0);
        assert_eq!(report.edges_removed, 0);
        assert_eq!(state.get_peer("A").unwrap().unwrap().last_seen, 900);
        assert_eq!(state.replica_count("cidX").unwrap(), 1);
        assert_eq!(detector.metrics.known_peers.get(), 1);
    }
}
