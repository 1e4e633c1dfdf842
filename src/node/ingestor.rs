//! Announcement ingestion
//!
//! Event-driven: every payload delivered on the announce channel is decoded
//! and applied to the state store. `last_seen` always comes from the local
//! clock at receipt, so a peer with a skewed clock cannot escape pruning.

use std::sync::Arc;
use std::time::Duration;

use super::message::GossipMessage;
use super::Shutdown;
use crate::common::{timestamp_now, NodeMetrics, Result};
use crate::state::StateStore;
use crate::transport::Transport;

/// Delay before re-subscribing after the subscription is lost
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// What happened to one inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied { peer_id: String, content_count: usize },
    /// Our own announcement echoed back
    IgnoredSelf,
    /// A message type this node does not handle
    IgnoredType,
    Dropped(String),
}

pub struct Ingestor {
    state: Arc<dyn StateStore>,
    metrics: Arc<NodeMetrics>,
}

impl Ingestor {
    pub fn new(state: Arc<dyn StateStore>, metrics: Arc<NodeMetrics>) -> Self {
        Self { state, metrics }
    }

    /// Apply one payload received at `now`.
    ///
    /// Malformed and irrelevant messages are reported in the outcome; only
    /// state store failures are returned as errors.
    pub fn ingest(&self, payload: &[u8], now: u64) -> Result<IngestOutcome> {
        let announcement = match GossipMessage::decode(payload) {
            Ok(GossipMessage::Announce(announcement)) => announcement,
            Ok(GossipMessage::Unknown) => {
                self.metrics.messages_ignored.inc();
                return Ok(IngestOutcome::IgnoredType);
            }
            Err(e) => {
                self.metrics.messages_dropped.inc();
                return Ok(IngestOutcome::Dropped(e.to_string()));
            }
        };

        if announcement.peer_id == self.state.local_peer_id() {
            self.metrics.messages_ignored.inc();
            return Ok(IngestOutcome::IgnoredSelf);
        }

        self.state.apply_announcement(
            &announcement.peer_id,
            announcement.free_capacity_gb,
            now,
            &announcement.held_content_ids,
        )?;
        self.metrics.messages_ingested.inc();

        Ok(IngestOutcome::Applied {
            peer_id: announcement.peer_id,
            content_count: announcement.held_content_ids.len(),
        })
    }

    fn handle(&self, payload: &[u8]) -> Result<()> {
        match self.ingest(payload, timestamp_now()) {
            Ok(IngestOutcome::Applied {
                peer_id,
                content_count,
            }) => {
                tracing::debug!(peer_id = %peer_id, content_count, "Applied announcement");
                Ok(())
            }
            Ok(IngestOutcome::Dropped(reason)) => {
                tracing::warn!("Dropped malformed message: {}", reason);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Failed to apply announcement: {}", e);
                Ok(())
            }
        }
    }

    /// Consume `channel` until shutdown, re-subscribing if delivery stops
    pub async fn run(
        self,
        transport: Arc<dyn Transport>,
        channel: String,
        mut shutdown: Shutdown,
    ) -> Result<()> {
        tracing::info!(channel = %channel, "Ingestor started");

        'subscription: loop {
            if *shutdown.borrow() {
                break;
            }
            let mut rx = match transport.subscribe(&channel).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::warn!("Subscribe failed, retrying: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(payload) => {
                            if let Err(e) = self.handle(&payload) {
                                tracing::error!("Ingestor stopping on state store failure: {}", e);
                                return Err(e);
                            }
                        }
                        None => {
                            tracing::warn!("Subscription closed, re-subscribing");
                            continue 'subscription;
                        }
                    },
                    _ = shutdown.changed() => break 'subscription,
                }
            }
        }

        tracing::info!("Ingestor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::message::Announcement;
    use crate::state::MemoryStateStore;

    fn ingestor() -> (Arc<MemoryStateStore>, Arc<NodeMetrics>, Ingestor) {
        let state = Arc::new(MemoryStateStore::new("self"));
        let metrics = Arc::new(NodeMetrics::new());
        let ingestor = Ingestor::new(state.clone(), metrics.clone());
        (state, metrics, ingestor)
    }

    fn announce(peer_id: &str, free: f64, ids: &[&str], timestamp: u64) -> Vec<u8> {
        GossipMessage::Announce(Announcement {
            peer_id: peer_id.into(),
            free_capacity_gb: free,
            held_content_ids: ids.iter().map(|s| s.to_string()).collect(),
            timestamp,
        })
        .encode()
        .unwrap()
        .to_vec()
    }

    #[test]
    fn test_applies_announcement_with_local_time() {
        let (state, metrics, ingestor) = ingestor();
        // sender clock far in the future; receive time wins
        let payload = announce("A", 50.0, &["cidX"], 9_999_999_999);

        let outcome = ingestor.ingest(&payload, 1000).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Applied {
                peer_id: "A".into(),
                content_count: 1
            }
        );

        let peer = state.get_peer("A").unwrap().unwrap();
        assert_eq!(peer.last_seen, 1000);
        assert_eq!(peer.free_capacity_gb, 50.0);
        assert_eq!(state.list_content_with_replica_counts().unwrap(), vec![("cidX".to_string(), 1)]);
        assert_eq!(metrics.messages_ingested.get(), 1);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let (state, _, ingestor) = ingestor();
        let payload = announce("A", 50.0, &["cidX", "cidY"], 1);
        ingestor.ingest(&payload, 1000).unwrap();
        let peers = state.list_peers().unwrap();
        let counts = state.list_content_with_replica_counts().unwrap();

        ingestor.ingest(&payload, 1000).unwrap();
        assert_eq!(state.list_peers().unwrap(), peers);
        assert_eq!(state.list_content_with_replica_counts().unwrap(), counts);
    }

    #[test]
    fn test_ignores_self_and_other_types() {
        let (state, metrics, ingestor) = ingestor();

        let own = announce("self", 10.0, &["cidX"], 1);
        assert_eq!(ingestor.ingest(&own, 1000).unwrap(), IngestOutcome::IgnoredSelf);

        let other = br#"{"type":"heartbeat","peer_id":"A"}"#;
        assert_eq!(ingestor.ingest(other, 1000).unwrap(), IngestOutcome::IgnoredType);

        assert!(state.list_peers().unwrap().is_empty());
        assert!(state.list_content_with_replica_counts().unwrap().is_empty());
        assert_eq!(metrics.messages_ignored.get(), 2);
    }

    #[test]
    fn test_malformed_is_dropped_without_state_change() {
        let (state, metrics, ingestor) = ingestor();
        let outcome = ingestor.ingest(br#"{"type":"announce","peer_id":"A"}"#, 1000).unwrap();

        assert!(matches!(outcome, IngestOutcome::Dropped(_)));
        assert!(state.list_peers().unwrap().is_empty());
        assert_eq!(metrics.messages_dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_run_consumes_subscription() {
        use crate::transport::LocalBus;

        let bus = LocalBus::default();
        let (state, _, ingestor) = ingestor();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(ingestor.run(Arc::new(bus.endpoint()), "announce".into(), rx));

        let sender = bus.endpoint();
        let payload = bytes::Bytes::from(announce("B", 5.0, &["cidZ"], 1));
        for _ in 0..50 {
            sender.broadcast("announce", payload.clone()).await.unwrap();
            if state.get_peer("B").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(state.get_peer("B").unwrap().is_some());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_keeps_going_after_bad_message() {
        use crate::transport::LocalBus;

        let bus = LocalBus::default();
        let (state, metrics, ingestor) = ingestor();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(ingestor.run(Arc::new(bus.endpoint()), "announce".into(), rx));
        let sender = bus.endpoint();

        // keep sending garbage until the running ingestor has dropped one
        for _ in 0..50 {
            sender
                .broadcast("announce", bytes::Bytes::from_static(b"\xff not json"))
                .await
                .unwrap();
            if metrics.messages_dropped.get() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(metrics.messages_dropped.get() > 0);
        assert!(!handle.is_finished());

        sender
            .broadcast("announce", bytes::Bytes::from(announce("B", 5.0, &["cidZ"], 1)))
            .await
            .unwrap();
        for _ in 0..50 {
            if state.get_peer("B").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.holders_of("cidZ").unwrap(), vec!["B".to_string()]);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
