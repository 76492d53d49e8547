//! Metrics for the fetch path
//!
//! Recorded through the `metrics` facade; the embedding application installs
//! whichever exporter it uses.
//!
//! ## Metrics Exposed:
//! - `featurefetch_batch_duration_seconds` - Batch latency histogram
//! - `featurefetch_responses_total{status}` - Responses by complete/partial/failed
//! - `featurefetch_lookups_total` - Physical keys sent to the store
//! - `featurefetch_coalesced_keys_total` - Logical lookups served by another's fetch
//! - `featurefetch_lookup_failures_total{kind}` - Failed physical lookups
//! - `featurefetch_store_call_duration_seconds{store}` - Per multi_get latency
//! - `featurefetch_plan_cache_total{outcome}` - Plan cache hit/miss/stale
//! - `featurefetch_plan_refresh_failures_total` - Failed plan refreshes
//! - `featurefetch_plan_cache_entries` - Cached plans
//!
//! ## Usage:
//! ```rust,no_run
//! use featurefetch_online::observability::*;
//!
//! let _timer = time_batch();
//! // ... serve the batch ...
//! record_response("complete");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Timer for a whole batch (records on drop)
pub struct BatchTimer {
    start: Instant,
}

impl Default for BatchTimer {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl BatchTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for BatchTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!("featurefetch_batch_duration_seconds", duration);
    }
}

/// Start timing a batch
pub fn time_batch() -> BatchTimer {
    BatchTimer::new()
}

pub fn record_response(status: &'static str) {
    counter!("featurefetch_responses_total", 1, "status" => status);
}

pub fn increment_lookups(count: usize) {
    counter!("featurefetch_lookups_total", count as u64);
}

pub fn increment_coalesced(count: usize) {
    if count > 0 {
        counter!("featurefetch_coalesced_keys_total", count as u64);
    }
}

pub fn increment_lookup_failures(kind: &'static str) {
    counter!("featurefetch_lookup_failures_total", 1, "kind" => kind);
}

pub fn record_store_call(store: &'static str, duration: Duration) {
    histogram!(
        "featurefetch_store_call_duration_seconds",
        duration.as_secs_f64(),
        "store" => store
    );
}

// ==================== Plan Cache Metrics ====================

pub fn record_plan_cache(outcome: &'static str) {
    counter!("featurefetch_plan_cache_total", 1, "outcome" => outcome);
}

pub fn increment_refresh_failures() {
    counter!("featurefetch_plan_refresh_failures_total", 1);
}

pub fn set_plan_cache_size(entries: usize) {
    gauge!("featurefetch_plan_cache_entries", entries as f64);
}
