//! Result cache behaviour seen through `QueryGovernor::execute`

use crate::common::{fast_config, MockBackend, UnavailableCacheStore};
use query_governor::{ErrorKind, ExecuteOptions, GovernorConfig, QueryGovernor};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const USER_BY_ID: &str = "SELECT id, email FROM users WHERE id = $1";

#[tokio::test]
async fn test_second_read_within_ttl_is_identical_cache_hit() {
    let backend = MockBackend::new();
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    let first = assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], ExecuteOptions::new()).await);
    let hits_before = governor.snapshot().cache_hits;
    let second = assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], ExecuteOptions::new()).await);

    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(backend.executions(), 1);

    let stats = governor.snapshot();
    assert_eq!(stats.cache_hits, hits_before + 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.total_queries, 2);
    assert_eq!(stats.executed_queries, 1);
}

#[tokio::test]
async fn test_different_parameters_do_not_share_a_slot() {
    let backend = MockBackend::new();
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    let one = assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], ExecuteOptions::new()).await);
    let two = assert_ok!(governor.execute(USER_BY_ID, &[json!(2)], ExecuteOptions::new()).await);

    assert_ne!(one, two);
    assert_eq!(backend.executions(), 2);
    assert_eq!(governor.snapshot().cache_hits, 0);
}

#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let backend = MockBackend::new();
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();
    let options = ExecuteOptions::new().with_cache_ttl(Duration::from_millis(50));

    assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], options.clone()).await);
    assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], options.clone()).await);
    assert_eq!(governor.snapshot().cache_hits, 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let refreshed = assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], options).await);

    assert_eq!(refreshed[0]["execution"], json!(2));
    let stats = governor.snapshot();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
}

#[tokio::test]
async fn test_unavailable_cache_store_degrades_to_direct_execution() {
    let backend = MockBackend::new();
    let store = Arc::new(UnavailableCacheStore::default());
    let governor = QueryGovernor::builder()
        .with_config(fast_config())
        .with_cache_store(store.clone())
        .build(backend.factory())
        .unwrap();

    for _ in 0..2 {
        let rows = assert_ok!(governor.execute(USER_BY_ID, &[json!(9)], ExecuteOptions::new()).await);
        assert_eq!(rows[0]["params"], json!([9]));
    }

    assert_eq!(backend.executions(), 2);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    let stats = governor.snapshot();
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.cache_errors, 4);

    // maintenance calls do surface the store failure
    let err = assert_err!(governor.invalidate_cache().await);
    assert_eq!(err.kind, ErrorKind::CacheError);
}

#[tokio::test]
async fn test_disabled_cache_always_executes() {
    let backend = MockBackend::new();
    let config = GovernorConfig {
        enable_query_cache: false,
        ..fast_config()
    };
    let governor = QueryGovernor::new(backend.factory(), config).unwrap();

    assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], ExecuteOptions::new()).await);
    assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], ExecuteOptions::new()).await);
    assert_eq!(backend.executions(), 2);
    assert_ok!(governor.invalidate_cache().await);
}

#[tokio::test]
async fn test_invalidate_cache_forces_re_execution() {
    let backend = MockBackend::new();
    let governor = QueryGovernor::new(backend.factory(), fast_config()).unwrap();

    assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], ExecuteOptions::new()).await);
    assert_ok!(governor.invalidate_cache().await);
    assert_ok!(governor.execute(USER_BY_ID, &[json!(1)], ExecuteOptions::new()).await);

    assert_eq!(backend.executions(), 2);
}
