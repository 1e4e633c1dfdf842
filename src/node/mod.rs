//! Replication coordinator node
//!
//! Four loops share the local state store and nothing else:
//! - `announcer`: broadcasts this node's capacity and holdings
//! - `ingestor`: applies announcements received from peers
//! - `enforcer`: pins under-replicated content while capacity allows
//! - `detector`: prunes silent peers, cascading their replica edges
//!
//! There is no master loop; the enforcer reacts to pruning only through the
//! replica counts it reads back from the store.

pub mod announcer;
pub mod backoff;
pub mod capacity;
pub mod detector;
pub mod enforcer;
pub mod http;
pub mod ingestor;
pub mod message;
pub mod server;

pub use announcer::Announcer;
pub use capacity::{CapacityEstimator, CapacityReport};
pub use detector::{FailureDetector, PruneReport};
pub use enforcer::{EnforcementReport, Enforcer, EnforcerSettings};
pub use ingestor::{IngestOutcome, Ingestor};
pub use message::{Announcement, GossipMessage};
pub use server::{Node, NodeTasks};

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// Cooperative shutdown signal; `true` means stop after the current step
pub type Shutdown = watch::Receiver<bool>;

pub(crate) fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// A `ticker` whose first tick lands at a random point in the first half period
pub(crate) fn jittered_ticker(period: std::time::Duration) -> Interval {
    let max_ms = (period.as_millis() as u64 / 2).max(1);
    let delay = std::time::Duration::from_millis(rand::random::<u64>() % max_ms);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Wait for the next tick. Returns false once shutdown has been signalled.
pub(crate) async fn next_tick(interval: &mut Interval, shutdown: &mut Shutdown) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = interval.tick() => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}
