//! Stats Aggregator
//!
//! Lock-free counters updated on the hot path, folded together with the recorder
//! summary and pool occupancy into one [`GovernorStats`] snapshot.

use crate::utils::{percentage, round_to_decimal_places};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::connection_pool::PoolSnapshot;
use super::performance_monitor::RecorderSummary;

/// Nearest-rank percentile: sort ascending, take index `ceil(n * p / 100) - 1`.
/// Returns 0 for an empty sample.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let p = p.clamp(0.0, 100.0);
    let rank = (sorted.len() as f64 * p / 100.0).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

#[derive(Debug, Default)]
pub struct QueryCounters {
    total_queries: AtomicU64,
    executed_queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
    timeouts: AtomicU64,
    backend_errors: AtomicU64,
    analyses_run: AtomicU64,
    analysis_failures: AtomicU64,
}

/// Plain copy of [`QueryCounters`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValues {
    pub total_queries: u64,
    pub executed_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub timeouts: u64,
    pub backend_errors: u64,
    pub analyses_run: u64,
    pub analysis_failures: u64,
}

impl QueryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self) {
        self.executed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_analysis(&self, succeeded: bool) {
        self.analyses_run.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.analysis_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn values(&self) -> CounterValues {
        CounterValues {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            executed_queries: self.executed_queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            analyses_run: self.analyses_run.load(Ordering::Relaxed),
            analysis_failures: self.analysis_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time governor statistics for an external metrics sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorStats {
    /// Every `execute` call, cache hits included
    pub total_queries: u64,
    /// Calls that reached the backend
    pub executed_queries: u64,
    pub slow_queries: u64,
    pub avg_query_time_ms: f64,
    pub p95_query_time_ms: f64,
    pub p99_query_time_ms: f64,
    /// `cache_hits / total_queries * 100`
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub timeouts: u64,
    pub backend_errors: u64,
    pub analyses_run: u64,
    pub analysis_failures: u64,
    pub slow_query_signature_count: usize,
    pub suggestion_count: usize,
    pub pool: PoolSnapshot,
    pub collected_at: DateTime<Utc>,
}

impl GovernorStats {
    pub fn assemble(
        counters: CounterValues,
        recorder: &RecorderSummary,
        suggestion_count: usize,
        pool: PoolSnapshot,
    ) -> Self {
        Self {
            total_queries: counters.total_queries,
            executed_queries: counters.executed_queries,
            slow_queries: recorder.slow_queries,
            avg_query_time_ms: round_to_decimal_places(recorder.avg_time_ms, 3),
            p95_query_time_ms: percentile(&recorder.recent_latencies_ms, 95.0),
            p99_query_time_ms: percentile(&recorder.recent_latencies_ms, 99.0),
            cache_hit_rate: round_to_decimal_places(
                percentage(counters.cache_hits, counters.total_queries),
                2,
            ),
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            cache_errors: counters.cache_errors,
            timeouts: counters.timeouts,
            backend_errors: counters.backend_errors,
            analyses_run: counters.analyses_run,
            analysis_failures: counters.analysis_failures,
            slow_query_signature_count: recorder.slow_signature_count,
            suggestion_count,
            pool,
            collected_at: Utc::now(),
        }
    }
}
