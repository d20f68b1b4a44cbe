//! Operational counters for the retrieval path.
//!
//! Counters are plain atomics updated with `Relaxed` ordering; a
//! [`MetricsSnapshot`] is assembled on demand by the service from these
//! counters, the cache's stats and the reindex coordinator's state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RetrievalMetrics {
    queries: AtomicU64,
    query_micros: AtomicU64,
    stage0_queries: AtomicU64,
    stage0_hits: AtomicU64,
    stage0_failures: AtomicU64,
    stage1_failures: AtomicU64,
    unavailable: AtomicU64,
    stale_index_entries: AtomicU64,
}

impl RetrievalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One answered request, cached or computed.
    pub fn record_query(&self, elapsed: Duration) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// One Stage 0 run; `hit` when it contributed at least one document.
    pub fn record_stage0(&self, hit: bool) {
        self.stage0_queries.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.stage0_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stage0_failure(&self) {
        self.stage0_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage1_failure(&self) {
        self.stage1_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_stale_index_entries(&self, n: u64) {
        self.stale_index_entries.store(n, Ordering::Relaxed);
    }

    pub fn stale_index_entries(&self) -> u64 {
        self.stale_index_entries.load(Ordering::Relaxed)
    }

    pub fn exact_match_hit_rate(&self) -> f64 {
        ratio(
            self.stage0_hits.load(Ordering::Relaxed),
            self.stage0_queries.load(Ordering::Relaxed),
        )
    }

    pub fn avg_query_time_ms(&self) -> f64 {
        let n = self.queries.load(Ordering::Relaxed);
        if n == 0 {
            return 0.0;
        }
        self.query_micros.load(Ordering::Relaxed) as f64 / n as f64 / 1000.0
    }

    pub fn counters(&self) -> QueryCounters {
        QueryCounters {
            queries: self.queries.load(Ordering::Relaxed),
            stage0_failures: self.stage0_failures.load(Ordering::Relaxed),
            stage1_failures: self.stage1_failures.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryCounters {
    pub queries: u64,
    pub stage0_failures: u64,
    pub stage1_failures: u64,
    pub unavailable: u64,
}

/// The operational surface exposed by `crk metrics` and `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub stale_index_entries: u64,
    pub exact_match_hit_rate: f64,
    pub avg_query_time_ms: f64,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub inflight_count: usize,
    pub reindex_mutex_state: String,
    /// Unix seconds of the last successful promotion, if any.
    pub last_reindex_timestamp: Option<i64>,
    pub active_generation: u64,
    pub counters: QueryCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_start_at_zero() {
        let m = RetrievalMetrics::new();
        assert_eq!(m.exact_match_hit_rate(), 0.0);
        assert_eq!(m.avg_query_time_ms(), 0.0);
    }

    #[test]
    fn test_hit_rate_and_average() {
        let m = RetrievalMetrics::new();
        m.record_stage0(true);
        m.record_stage0(false);
        m.record_stage0(true);
        m.record_stage0(true);
        assert_eq!(m.exact_match_hit_rate(), 0.75);

        m.record_query(Duration::from_millis(10));
        m.record_query(Duration::from_millis(30));
        assert!((m.avg_query_time_ms() - 20.0).abs() < 1e-9);
        assert_eq!(m.counters().queries, 2);
    }
}
