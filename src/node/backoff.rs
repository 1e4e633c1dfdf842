//! Retry policies for failed pins
//!
//! The enforcer consults the policy before each pin attempt. The default
//! retries every pass; `ExponentialBackoff` spaces out attempts against
//! objects that keep failing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::common::PinBackoff;

pub trait RetryPolicy: Send + Sync {
    /// May `content_id` be pinned at `now` (unix seconds)?
    fn should_attempt(&self, content_id: &str, now: u64) -> bool;

    fn record_failure(&self, content_id: &str, now: u64);

    fn record_success(&self, content_id: &str);

    /// Forget every id not in `candidates`, called once per pass
    fn retain(&self, _candidates: &BTreeSet<String>) {}
}

impl<T: RetryPolicy + ?Sized> RetryPolicy for Arc<T> {
    fn should_attempt(&self, content_id: &str, now: u64) -> bool {
        (**self).should_attempt(content_id, now)
    }

    fn record_failure(&self, content_id: &str, now: u64) {
        (**self).record_failure(content_id, now)
    }

    fn record_success(&self, content_id: &str) {
        (**self).record_success(content_id)
    }

    fn retain(&self, candidates: &BTreeSet<String>) {
        (**self).retain(candidates)
    }
}

/// Build the policy selected in configuration
pub fn from_config(backoff: PinBackoff) -> Box<dyn RetryPolicy> {
    match backoff {
        PinBackoff::None => Box::new(RetryForever),
        PinBackoff::Exponential {
            base_secs,
            max_secs,
        } => Box::new(ExponentialBackoff::new(base_secs, max_secs)),
    }
}

/// Attempt every candidate on every pass
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryForever;

impl RetryPolicy for RetryForever {
    fn should_attempt(&self, _content_id: &str, _now: u64) -> bool {
        true
    }

    fn record_failure(&self, _content_id: &str, _now: u64) {}

    fn record_success(&self, _content_id: &str) {}
}

#[derive(Debug, Clone, Copy)]
struct FailureState {
    failures: u32,
    retry_at: u64,
}

/// Wait `base * 2^(failures - 1)` seconds (capped at `max`) after a failure
#[derive(Debug)]
pub struct ExponentialBackoff {
    base_secs: u64,
    max_secs: u64,
    failures: Mutex<HashMap<String, FailureState>>,
}

impl ExponentialBackoff {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        Self {
            base_secs,
            max_secs,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Number of ids currently backing off
    pub fn tracked(&self) -> usize {
        self.failures.lock().map_or(0, |failures| failures.len())
    }

    fn delay_for(&self, failures: u32) -> u64 {
        let exp = failures.saturating_sub(1).min(32);
        self.base_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_secs)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_attempt(&self, content_id: &str, now: u64) -> bool {
        match self.failures.lock() {
            Ok(failures) => failures
                .get(content_id)
                .map_or(true, |state| now >= state.retry_at),
            Err(_) => true,
        }
    }

    fn record_failure(&self, content_id: &str, now: u64) {
        if let Ok(mut failures) = self.failures.lock() {
            let count = failures.get(content_id).map_or(0, |s| s.failures) + 1;
            let retry_at = now.saturating_add(self.delay_for(count));
            failures.insert(
                content_id.to_string(),
                FailureState {
                    failures: count,
                    retry_at,
                },
            );
        }
    }

    fn record_success(&self, content_id: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(content_id);
        }
    }

    fn retain(&self, candidates: &BTreeSet<String>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.retain(|content_id, _| candidates.contains(content_id));
        }
    }
}
