//! Deadlines, pool admission and lifecycle

use crate::common::{fast_config, wait_until, MockBackend};
use query_governor::{
    BackendFailure, ErrorKind, ExecuteOptions, GovernorConfig, PoolConfig, QueryGovernor,
};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_caller_deadline_yields_timeout_error() {
    let backend = MockBackend::new().with_latency("pg_sleep", 200);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    let started = Instant::now();
    let err = assert_err!(
        governor
            .execute(
                "SELECT pg_sleep(0.2)",
                &[],
                ExecuteOptions::new().with_timeout_ms(50)
            )
            .await
    );
    let waited = started.elapsed();

    assert_eq!(err.kind, ErrorKind::TimeoutError);
    assert!(err.message.contains("50"), "message was {}", err.message);
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(150), "took {:?}", waited);

    // elapsed time is still recorded for the abandoned call
    let stats = governor.snapshot();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.executed_queries, 1);
    let signature = &governor.signature_stats()[0];
    assert_eq!(signature.count, 1);
    assert_eq!(signature.error_count, 1);
    assert!(signature.max_time_ms >= 50.0);
}

#[tokio::test]
async fn test_abandoned_statement_still_runs_and_returns_its_connection() {
    let backend = MockBackend::new().with_latency("pg_sleep", 100);
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    assert_err!(
        governor
            .execute("SELECT pg_sleep(0.1)", &[], ExecuteOptions::new().with_timeout_ms(20))
            .await
    );
    assert_eq!(backend.executions(), 0);

    assert!(wait_until(Duration::from_secs(1), || backend.executions() == 1).await);
    assert!(wait_until(Duration::from_secs(1), || governor.pool_snapshot().idle == 1).await);
}

#[tokio::test]
async fn test_requested_timeout_is_clamped_to_statement_bound() {
    let backend = MockBackend::new().with_latency("pg_sleep", 300);
    let config = GovernorConfig {
        query_timeout_ms: 50,
        statement_timeout_ms: 80,
        slow_query_threshold_ms: 20,
        deep_analysis_threshold_ms: 40,
        ..GovernorConfig::default()
    };
    let governor = QueryGovernor::new(backend.factory(), config).unwrap();

    let err = assert_err!(
        governor
            .execute("SELECT pg_sleep(1)", &[], ExecuteOptions::new().with_timeout_ms(60_000))
            .await
    );
    assert_eq!(err.kind, ErrorKind::TimeoutError);
    assert!(err.message.contains("80"), "message was {}", err.message);
}

#[tokio::test]
async fn test_exhausted_pool_surfaces_connection_error() {
    let backend = MockBackend::new().with_latency("report", 300);
    let config = GovernorConfig {
        pool: PoolConfig {
            max_connections: 1,
            min_idle_connections: 0,
            acquire_timeout_ms: 30,
        },
        ..fast_config()
    };
    let governor = QueryGovernor::new(backend.factory(), config).unwrap();

    let long_running = {
        let governor = governor.clone();
        tokio::spawn(async move {
            governor
                .execute("SELECT * FROM report", &[], ExecuteOptions::new())
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(1), || governor.pool_snapshot().total == 1).await);

    let err = assert_err!(
        governor
            .execute("SELECT 1", &[], ExecuteOptions::new().skip_cache())
            .await
    );
    assert_eq!(err.kind, ErrorKind::ConnectionError);
    assert_eq!(err.error_code.as_deref(), Some("POOL_EXHAUSTED"));

    assert_ok!(long_running.await.unwrap());
    let pool = governor.pool_snapshot();
    assert_eq!(pool.max, 1);
    assert_eq!(pool.waiting, 0);
}

#[tokio::test]
async fn test_backend_errors_reach_caller_unchanged() {
    let backend = MockBackend::new()
        .with_failure(
            "INSERT INTO users",
            BackendFailure::Statement(
                "duplicate key value violates unique constraint \"users_email_key\"".into(),
            ),
        )
        .with_failure("FROM offline", BackendFailure::Connection("connection reset by peer".into()));
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    let err = assert_err!(
        governor
            .execute("INSERT INTO users (email) VALUES ($1)", &[json!("a@b.c")], ExecuteOptions::new())
            .await
    );
    assert_eq!(err.kind, ErrorKind::BackendError);
    assert_eq!(
        err.message,
        "duplicate key value violates unique constraint \"users_email_key\""
    );

    let err = assert_err!(
        governor
            .execute("SELECT * FROM offline", &[], ExecuteOptions::new())
            .await
    );
    assert_eq!(err.kind, ErrorKind::ConnectionError);
    // the rejected insert left its session reusable, the broken one was dropped
    assert_eq!(backend.connects(), 1);
    assert_eq!(governor.pool_snapshot().total, 0);
}

#[tokio::test]
async fn test_close_drains_pool_and_rejects_new_work() {
    let backend = MockBackend::new();
    let config = GovernorConfig {
        pool: PoolConfig {
            max_connections: 4,
            min_idle_connections: 2,
            acquire_timeout_ms: 100,
        },
        ..fast_config()
    };
    let governor = QueryGovernor::new(backend.factory(), config).unwrap();

    assert_eq!(assert_ok!(governor.warm_up().await), 2);
    assert_eq!(backend.connects(), 2);
    assert_ok!(governor.execute("SELECT 1", &[], ExecuteOptions::new()).await);
    assert_eq!(backend.connects(), 2);

    governor.close();
    governor.close();
    assert_eq!(governor.pool_snapshot().total, 0);

    let err = assert_err!(governor.execute("SELECT 1", &[], ExecuteOptions::new()).await);
    assert_eq!(err.kind, ErrorKind::ConnectionError);
    let err = assert_err!(governor.apply_recommended_indexes(&[]).await);
    assert_eq!(err.kind, ErrorKind::ConnectionError);
}
