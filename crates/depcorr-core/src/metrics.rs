//! Tracker metrics
//!
//! Counters for the Begin/End state machine and the resolution cache. All
//! counters are relaxed atomics; reading them never blocks a tracked call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics shared by the cache, the resolver, and the tracker
#[derive(Debug)]
pub struct TrackerMetrics {
    start_time: Instant,
    pub calls: CallMetrics,
    pub resolver: ResolverMetrics,
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            calls: CallMetrics::default(),
            resolver: ResolverMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP depcorr_uptime_seconds Time since the tracker started\n");
        output.push_str("# TYPE depcorr_uptime_seconds gauge\n");
        output.push_str(&format!("depcorr_uptime_seconds {}\n\n", self.uptime_seconds()));

        output.push_str("# HELP depcorr_begin_total Begin notifications by outcome\n");
        output.push_str("# TYPE depcorr_begin_total counter\n");
        for (outcome, counter) in [
            ("tracked", &self.calls.begins),
            ("self_ingestion", &self.calls.begins_ignored),
            ("externally_owned", &self.calls.begins_skipped_owned),
            ("already_tracked", &self.calls.begins_duplicate),
            ("rejected", &self.calls.begins_rejected),
        ] {
            output.push_str(&format!(
                "depcorr_begin_total{{outcome=\"{}\"}} {}\n",
                outcome,
                counter.load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP depcorr_end_total End notifications by outcome\n");
        output.push_str("# TYPE depcorr_end_total counter\n");
        for (outcome, counter) in [
            ("emitted", &self.calls.emitted),
            ("unmatched", &self.calls.ends_unmatched),
            ("externally_owned", &self.calls.ends_owned),
        ] {
            output.push_str(&format!(
                "depcorr_end_total{{outcome=\"{}\"}} {}\n",
                outcome,
                counter.load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP depcorr_headers_injected_total Outgoing requests that received correlation headers\n");
        output.push_str("# TYPE depcorr_headers_injected_total counter\n");
        output.push_str(&format!(
            "depcorr_headers_injected_total {}\n\n",
            self.calls.headers_injected.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP depcorr_cache_expired_total Pending calls evicted by TTL\n");
        output.push_str("# TYPE depcorr_cache_expired_total counter\n");
        output.push_str(&format!(
            "depcorr_cache_expired_total {}\n\n",
            self.calls.expired.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP depcorr_hook_errors_total Errors caught at the Begin/End boundary\n");
        output.push_str("# TYPE depcorr_hook_errors_total counter\n");
        output.push_str(&format!(
            "depcorr_hook_errors_total {}\n\n",
            self.calls.hook_errors.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP depcorr_resolver_fetch_total Correlation id fetches by outcome\n");
        output.push_str("# TYPE depcorr_resolver_fetch_total counter\n");
        output.push_str(&format!(
            "depcorr_resolver_fetch_total{{outcome=\"started\"}} {}\n",
            self.resolver.fetches.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "depcorr_resolver_fetch_total{{outcome=\"failed\"}} {}\n\n",
            self.resolver.fetch_failures.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP depcorr_resolver_coalesced_total Lookups that awaited an in-flight fetch\n");
        output.push_str("# TYPE depcorr_resolver_coalesced_total counter\n");
        output.push_str(&format!(
            "depcorr_resolver_coalesced_total {}\n\n",
            self.resolver.coalesced.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP depcorr_resolver_backoff_total Lookups short-circuited by failure backoff\n");
        output.push_str("# TYPE depcorr_resolver_backoff_total counter\n");
        output.push_str(&format!(
            "depcorr_resolver_backoff_total {}\n",
            self.resolver.backoff_skips.load(Ordering::Relaxed)
        ));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "calls": {
                "begins": self.calls.begins.load(Ordering::Relaxed),
                "begins_ignored": self.calls.begins_ignored.load(Ordering::Relaxed),
                "begins_skipped_owned": self.calls.begins_skipped_owned.load(Ordering::Relaxed),
                "begins_duplicate": self.calls.begins_duplicate.load(Ordering::Relaxed),
                "begins_rejected": self.calls.begins_rejected.load(Ordering::Relaxed),
                "headers_injected": self.calls.headers_injected.load(Ordering::Relaxed),
                "emitted": self.calls.emitted.load(Ordering::Relaxed),
                "ends_unmatched": self.calls.ends_unmatched.load(Ordering::Relaxed),
                "ends_owned": self.calls.ends_owned.load(Ordering::Relaxed),
                "expired": self.calls.expired.load(Ordering::Relaxed),
                "hook_errors": self.calls.hook_errors.load(Ordering::Relaxed),
            },
            "resolver": {
                "fetches": self.resolver.fetches.load(Ordering::Relaxed),
                "fetch_failures": self.resolver.fetch_failures.load(Ordering::Relaxed),
                "coalesced": self.resolver.coalesced.load(Ordering::Relaxed),
                "backoff_skips": self.resolver.backoff_skips.load(Ordering::Relaxed),
            },
        })
    }
}

/// Begin/End state machine counters
#[derive(Debug, Default)]
pub struct CallMetrics {
    pub begins: AtomicU64,
    pub begins_ignored: AtomicU64,
    pub begins_skipped_owned: AtomicU64,
    pub begins_duplicate: AtomicU64,
    pub begins_rejected: AtomicU64,
    pub headers_injected: AtomicU64,
    pub emitted: AtomicU64,
    pub ends_unmatched: AtomicU64,
    pub ends_owned: AtomicU64,
    pub expired: AtomicU64,
    pub hook_errors: AtomicU64,
}

/// Resolution cache counters
#[derive(Debug, Default)]
pub struct ResolverMetrics {
    pub fetches: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub coalesced: AtomicU64,
    pub backoff_skips: AtomicU64,
}

/// Increment a counter by one
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Shared metrics instance
pub type SharedMetrics = Arc<TrackerMetrics>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(TrackerMetrics::new())
}
