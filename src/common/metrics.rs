//! Node metrics
//!
//! Prometheus-compatible counters and gauges for the gossip, enforcement and
//! pruning loops. One `NodeMetrics` is shared (via `Arc`) by every task of a
//! node and rendered by the admin API at `/metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bucket boundaries for enforcement pass durations (in milliseconds)
const PASS_DURATION_BUCKETS: [f64; 9] = [
    10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0,
];

/// A simple histogram implementation for pass durations
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        let idx = self
            .boundaries
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum_ms(&self) -> u64 {
        self.sum_ms.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for one node
#[derive(Debug)]
pub struct NodeMetrics {
    pub announcements_sent: Counter,
    pub announcements_failed: Counter,
    pub messages_ingested: Counter,
    pub messages_ignored: Counter,
    pub messages_dropped: Counter,
    pub pins_succeeded: Counter,
    pub pins_failed: Counter,
    pub peers_pruned: Counter,
    pub edges_pruned: Counter,
    pub content_compacted: Counter,

    pub known_peers: Gauge,
    pub known_content: Gauge,
    pub under_replicated: Gauge,

    pub enforcement_duration: Histogram,

    started_at: Instant,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            announcements_sent: Counter::default(),
            announcements_failed: Counter::default(),
            messages_ingested: Counter::default(),
            messages_ignored: Counter::default(),
            messages_dropped: Counter::default(),
            pins_succeeded: Counter::default(),
            pins_failed: Counter::default(),
            peers_pruned: Counter::default(),
            edges_pruned: Counter::default(),
            content_compacted: Counter::default(),
            known_peers: Gauge::default(),
            known_content: Gauge::default(),
            under_replicated: Gauge::default(),
            enforcement_duration: Histogram::with_buckets(&PASS_DURATION_BUCKETS),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("tnet_announcements_sent_total", "Announcements broadcast", &self.announcements_sent),
            ("tnet_announcements_failed_total", "Announcements that failed to send", &self.announcements_failed),
            ("tnet_messages_ingested_total", "Peer announcements applied", &self.messages_ingested),
            ("tnet_messages_ignored_total", "Self or non-announce messages ignored", &self.messages_ignored),
            ("tnet_messages_dropped_total", "Malformed messages dropped", &self.messages_dropped),
            ("tnet_pins_succeeded_total", "Successful replica pins", &self.pins_succeeded),
            ("tnet_pins_failed_total", "Failed replica pins", &self.pins_failed),
            ("tnet_peers_pruned_total", "Peers removed by the failure detector", &self.peers_pruned),
            ("tnet_replica_edges_pruned_total", "Replica edges removed with pruned peers", &self.edges_pruned),
            ("tnet_content_compacted_total", "Orphaned content records compacted", &self.content_compacted),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges = [
            ("tnet_known_peers", "Peers currently in the local view", &self.known_peers),
            ("tnet_known_content", "Content identifiers currently tracked", &self.known_content),
            ("tnet_under_replicated", "Content below the target replica count", &self.under_replicated),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, gauge.get());
        }

        out.push_str("# HELP tnet_enforcement_duration_ms Enforcement pass duration in milliseconds\n");
        out.push_str("# TYPE tnet_enforcement_duration_ms histogram\n");
        for (le, count) in self.enforcement_duration.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "tnet_enforcement_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "tnet_enforcement_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "tnet_enforcement_duration_ms_sum {}", self.enforcement_duration.sum_ms());
        let _ = writeln!(out, "tnet_enforcement_duration_ms_count {}", self.enforcement_duration.count());

        out.push_str("# HELP tnet_uptime_seconds Node uptime in seconds\n");
        out.push_str("# TYPE tnet_uptime_seconds gauge\n");
        let _ = writeln!(out, "tnet_uptime_seconds {}", self.uptime_seconds());

        out
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
