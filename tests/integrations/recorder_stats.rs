//! Signature grouping, slow-query counting and the stats snapshot

use crate::common::{fast_config, MockBackend};
use query_governor::{percentile, ExecuteOptions, QueryGovernor};
use serde_json::json;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_literal_variants_share_a_signature() {
    let backend = MockBackend::new();
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    for sql in [
        "SELECT * FROM t WHERE id = 1",
        "SELECT * FROM t WHERE id = 2",
        "SELECT * FROM u WHERE id = 1",
    ] {
        assert_ok!(governor.execute(sql, &[], ExecuteOptions::new()).await);
    }

    let stats = governor.signature_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].signature, "SELECT * FROM t WHERE id = ?");
    assert_eq!(stats[0].count, 2);
    assert_eq!(stats[1].signature, "SELECT * FROM u WHERE id = ?");
    assert_eq!(stats[1].count, 1);
    for entry in &stats {
        assert!((entry.avg_time_ms - entry.total_time_ms / entry.count as f64).abs() < 1e-9);
        assert!(entry.max_time_ms <= entry.total_time_ms);
    }
}

#[tokio::test]
async fn test_each_slow_execution_counts_once() {
    let backend = MockBackend::new().with_latency("FROM audit_log", 30);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();
    let q = "SELECT * FROM audit_log WHERE actor = $1";

    for _ in 0..3 {
        assert_ok!(
            governor
                .execute(q, &[json!("svc")], ExecuteOptions::new().skip_cache())
                .await
        );
    }
    assert_eq!(governor.snapshot().slow_queries, 3);

    // hits never reach the backend, so they are not executions
    assert_ok!(governor.execute(q, &[json!("ops")], ExecuteOptions::new()).await);
    assert_ok!(governor.execute(q, &[json!("ops")], ExecuteOptions::new()).await);

    let stats = governor.snapshot();
    assert_eq!(stats.slow_queries, 4);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.total_queries, 5);

    let top = governor.top_slow_signatures(1);
    assert_eq!(top[0].signature, "SELECT * FROM audit_log WHERE actor = ?");
    assert_eq!(top[0].slow_count, 4);
}

#[tokio::test]
async fn test_fast_queries_are_not_slow() {
    let backend = MockBackend::new();
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    assert_ok!(governor.execute("SELECT 1", &[], ExecuteOptions::new()).await);
    let stats = governor.snapshot();
    assert_eq!(stats.slow_queries, 0);
    assert_eq!(stats.slow_query_signature_count, 0);
    assert!(stats.avg_query_time_ms < 20.0);
}

#[test]
fn test_p95_of_ten_to_thousand_ms() {
    let samples: Vec<f64> = (1..=100).map(|i| (i * 10) as f64).collect();
    assert_eq!(samples.len(), 100);
    assert_eq!(percentile(&samples, 95.0), 950.0);
    assert_eq!(percentile(&samples, 99.0), 990.0);

    let mut reversed = samples.clone();
    reversed.reverse();
    assert_eq!(percentile(&reversed, 95.0), 950.0);
}

#[tokio::test]
async fn test_snapshot_serializes_for_metrics_sink() {
    let backend = MockBackend::new();
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();
    assert_ok!(governor.execute("SELECT 1", &[], ExecuteOptions::new()).await);
    assert_ok!(governor.execute("SELECT 1", &[], ExecuteOptions::new()).await);

    let json = serde_json::to_value(governor.snapshot()).unwrap();
    assert_eq!(json["total_queries"], 2);
    assert_eq!(json["cache_hit_rate"], 50.0);
    assert_eq!(json["pool"]["max"], 4);
    assert_eq!(json["pool"]["idle"], 1);
    assert!(json["p95_query_time_ms"].is_number());
    assert!(json["collected_at"].is_string());
}
