//! Deep analysis and index suggestions end to end

use crate::common::{fast_config, wait_until, MockBackend, ORDERS_SEQ_SCAN_PLAN};
use query_governor::{
    ErrorKind, ExecuteOptions, GovernorConfig, IndexApplyStatus, IndexKind, QueryGovernor,
    SqlitePlanParser, SuggestionPriority,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const ORDERS_BY_CUSTOMER: &str = "SELECT * FROM orders WHERE customer_id = $1";

async fn wait_for_analyses(governor: &QueryGovernor, expected: u64) -> bool {
    wait_until(Duration::from_secs(2), || governor.snapshot().analyses_run >= expected).await
}

#[tokio::test]
async fn test_slow_orders_lookup_yields_one_customer_id_suggestion() {
    let backend = MockBackend::new()
        .with_latency("FROM orders", 60)
        .with_plan(ORDERS_SEQ_SCAN_PLAN);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    let rows = assert_ok!(
        governor
            .execute(ORDERS_BY_CUSTOMER, &[json!(42)], ExecuteOptions::new())
            .await
    );
    assert_eq!(rows.len(), 1);
    assert!(wait_for_analyses(&governor, 1).await);

    let suggestions = governor.pending_suggestions(10);
    assert_eq!(suggestions.len(), 1);
    let suggestion = &suggestions[0];
    assert_eq!(suggestion.kind, IndexKind::SingleColumn);
    assert_eq!(suggestion.table, "orders");
    assert_eq!(suggestion.column.as_deref(), Some("customer_id"));
    assert_eq!(suggestion.priority, SuggestionPriority::High);
    assert_eq!(suggestion.signature, "SELECT * FROM orders WHERE customer_id = ?");

    assert_eq!(
        backend.explain_log(),
        vec![format!("EXPLAIN (ANALYZE, BUFFERS) {}", ORDERS_BY_CUSTOMER)]
    );
    let stats = governor.snapshot();
    assert_eq!(stats.analysis_failures, 0);
    assert_eq!(stats.suggestion_count, 1);
    assert_eq!(stats.slow_query_signature_count, 1);
}

#[tokio::test]
async fn test_queries_below_deep_threshold_are_not_analyzed() {
    let backend = MockBackend::new()
        .with_latency("FROM orders", 25)
        .with_plan(ORDERS_SEQ_SCAN_PLAN);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    assert_ok!(
        governor
            .execute(ORDERS_BY_CUSTOMER, &[json!(1)], ExecuteOptions::new())
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = governor.snapshot();
    assert_eq!(stats.slow_queries, 1);
    assert_eq!(stats.analyses_run, 0);
    assert!(backend.explain_log().is_empty());
}

#[tokio::test]
async fn test_timed_out_statement_is_not_analyzed() {
    let backend = MockBackend::new()
        .with_latency("FROM orders", 200)
        .with_plan(ORDERS_SEQ_SCAN_PLAN);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    let err = assert_err!(
        governor
            .execute(
                ORDERS_BY_CUSTOMER,
                &[json!(7)],
                ExecuteOptions::new().with_timeout_ms(50)
            )
            .await
    );
    assert_eq!(err.kind, ErrorKind::TimeoutError);
    assert!(wait_until(Duration::from_secs(1), || backend.executions() == 1).await);

    let stats = governor.snapshot();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.analyses_run, 0);
    assert!(backend.explain_log().is_empty());
    assert!(governor.pending_suggestions(10).is_empty());
}

#[tokio::test]
async fn test_plan_analysis_can_be_disabled() {
    let backend = MockBackend::new()
        .with_latency("FROM orders", 60)
        .with_plan(ORDERS_SEQ_SCAN_PLAN);
    let config = GovernorConfig {
        enable_plan_analysis: false,
        ..fast_config()
    };
    let governor = QueryGovernor::new(backend.factory(), config).unwrap();

    assert_ok!(
        governor
            .execute(ORDERS_BY_CUSTOMER, &[json!(1)], ExecuteOptions::new())
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(governor.snapshot().analyses_run, 0);
}

#[tokio::test]
async fn test_analysis_failure_never_reaches_caller() {
    let backend = MockBackend::new()
        .with_latency("FROM orders", 60)
        .with_plan("ERROR:  permission denied for table orders");
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    let rows = assert_ok!(
        governor
            .execute(ORDERS_BY_CUSTOMER, &[json!(3)], ExecuteOptions::new())
            .await
    );
    assert_eq!(rows[0]["params"], json!([3]));
    assert!(wait_for_analyses(&governor, 1).await);

    let stats = governor.snapshot();
    assert_eq!(stats.analysis_failures, 1);
    assert_eq!(stats.suggestion_count, 0);
}

#[tokio::test]
async fn test_sqlite_dialect_and_deduplication() {
    let backend = MockBackend::new()
        .with_latency("FROM orders", 60)
        .with_plan("QUERY PLAN\n`--SCAN orders");
    let config = GovernorConfig {
        deduplicate_suggestions: true,
        ..fast_config()
    };
    let governor = QueryGovernor::builder()
        .with_config(config)
        .with_plan_parser(Arc::new(SqlitePlanParser::new()))
        .build(backend.factory())
        .unwrap();

    for customer in [1, 2] {
        assert_ok!(
            governor
                .execute(ORDERS_BY_CUSTOMER, &[json!(customer)], ExecuteOptions::new())
                .await
        );
    }
    assert!(wait_for_analyses(&governor, 2).await);

    assert_eq!(governor.snapshot().suggestion_count, 1);
    assert!(backend
        .explain_log()
        .iter()
        .all(|sql| sql.starts_with("EXPLAIN QUERY PLAN ")));
}

#[tokio::test]
async fn test_apply_recommended_indexes_is_idempotent() {
    let backend = MockBackend::new()
        .with_latency("FROM orders", 60)
        .with_plan(ORDERS_SEQ_SCAN_PLAN);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    assert_ok!(
        governor
            .execute(ORDERS_BY_CUSTOMER, &[json!(42)], ExecuteOptions::new())
            .await
    );
    assert!(wait_for_analyses(&governor, 1).await);
    let suggestions = governor.pending_suggestions(10);

    let applied = assert_ok!(governor.apply_recommended_indexes(&suggestions).await);
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].status, IndexApplyStatus::Created);
    assert_eq!(
        applied[0].ddl,
        "CREATE INDEX IF NOT EXISTS orders_customer_id_idx ON orders (customer_id)"
    );
    assert!(governor.pending_suggestions(10).is_empty());

    let again = assert_ok!(governor.apply_recommended_indexes(&suggestions).await);
    assert_eq!(again[0].status, IndexApplyStatus::Exists);
    assert!(again[0].error.is_none());
    assert_eq!(backend.ddl_log().len(), 2);
}

#[tokio::test]
async fn test_existing_index_reported_by_plan_is_not_suggested() {
    let plan = "Index Scan using orders_customer_id_idx on orders  (cost=0.42..8.44 rows=1 width=97)";
    let backend = MockBackend::new()
        .with_latency("FROM orders", 60)
        .with_plan(plan);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    assert_ok!(
        governor
            .execute(ORDERS_BY_CUSTOMER, &[json!(42)], ExecuteOptions::new())
            .await
    );
    assert!(wait_for_analyses(&governor, 1).await);

    assert!(governor.pending_suggestions(10).is_empty());
    assert_eq!(governor.snapshot().analysis_failures, 0);
}
