// Common Test Helper Functions
// Shared configuration and polling helpers for governor integration tests

#![allow(dead_code)]

use query_governor::{GovernorConfig, PoolConfig};
use std::time::{Duration, Instant};

/// Thresholds small enough for millisecond-scale mock latencies.
pub fn fast_config() -> GovernorConfig {
    GovernorConfig {
        query_timeout_ms: 1_000,
        statement_timeout_ms: 2_000,
        slow_query_threshold_ms: 20,
        deep_analysis_threshold_ms: 40,
        default_cache_ttl_seconds: 60,
        pool: PoolConfig {
            max_connections: 4,
            min_idle_connections: 0,
            acquire_timeout_ms: 500,
        },
        ..GovernorConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes. Detached analysis tasks
/// only make progress while the test yields.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
