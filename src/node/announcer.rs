//! Periodic self-announcement
//!
//! Each tick enumerates local content, measures capacity, records the local
//! node's own replica edges, and broadcasts an `announce` message. Nothing is
//! acknowledged; a failed broadcast waits for the next tick.

use std::sync::Arc;
use std::time::Duration;

use super::capacity::CapacityEstimator;
use super::message::{Announcement, GossipMessage};
use super::{next_tick, ticker, Shutdown};
use crate::common::{bytes_to_gb, timestamp_now, NodeMetrics, Result};
use crate::content::ContentStore;
use crate::state::StateStore;
use crate::transport::Transport;

pub struct Announcer {
    state: Arc<dyn StateStore>,
    content: Arc<dyn ContentStore>,
    transport: Arc<dyn Transport>,
    estimator: Arc<CapacityEstimator>,
    metrics: Arc<NodeMetrics>,
    channel: String,
    interval: Duration,
}

impl Announcer {
    pub fn new(
        state: Arc<dyn StateStore>,
        content: Arc<dyn ContentStore>,
        transport: Arc<dyn Transport>,
        estimator: Arc<CapacityEstimator>,
        metrics: Arc<NodeMetrics>,
        channel: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            content,
            transport,
            estimator,
            metrics,
            channel: channel.into(),
            interval,
        }
    }

    /// Build, record and broadcast one announcement stamped `now`
    pub async fn announce_once(&self, now: u64) -> Result<Announcement> {
        let held = self.content.list_held().await?;
        let report = self.estimator.measure(&held).await;

        let local = self.state.local_peer_id().to_string();
        for (content_id, size) in &report.sizes {
            self.state.upsert_content(content_id, bytes_to_gb(*size))?;
            self.state.upsert_replica_edge(content_id, &local)?;
        }

        let announcement = Announcement {
            peer_id: local,
            free_capacity_gb: report.available_gb,
            held_content_ids: held.into_iter().collect(),
            timestamp: now,
        };
        let payload = GossipMessage::Announce(announcement.clone()).encode()?;

        if let Err(e) = self.transport.broadcast(&self.channel, payload).await {
            self.metrics.announcements_failed.inc();
            return Err(e);
        }
        self.metrics.announcements_sent.inc();
        Ok(announcement)
    }

    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        let mut interval = ticker(self.interval);
        tracing::info!(channel = %self.channel, "Announcer started");

        while next_tick(&mut interval, &mut shutdown).await {
            match self.announce_once(timestamp_now()).await {
                Ok(announcement) => tracing::debug!(
                    held = announcement.held_content_ids.len(),
                    free_capacity_gb = announcement.free_capacity_gb,
                    "Announced"
                ),
                Err(e) if e.is_fatal() => {
                    tracing::error!("Announcer stopping on state store failure: {}", e);
                    return Err(e);
                }
                Err(e) => tracing::warn!("Announcement failed, retrying next tick: {}", e),
            }
        }

        tracing::info!("Announcer stopped");
        Ok(())
    }
}
