//! Query Governor
//!
//! Entry point wrapping a SQL backend: cache lookup, deadline-bounded execution
//! over the pool, latency recording and, for very slow successful statements, a
//! detached plan analysis that feeds the index advisor.

use crate::types::{ExecuteOptions, IndexApplyResult, Row};
use crate::utils::{ErrorKind, GovernorError, GovernorResult, Logger};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backend::ConnectionFactory;
use super::connection_pool::{ConnectionPool, PoolSnapshot};
use super::index_advisor::{IndexAdvisor, IndexSuggestion};
use super::performance_monitor::{ExecutionOutcome, PerformanceMonitor, QuerySignature, SignatureStats};
use super::plan_analyzer::{PlanAnalyzer, PlanParser, PostgresPlanParser};
use super::query_cache::{is_cacheable_statement, CacheStore, InMemoryCacheStore, QueryFingerprint, ResultCache};
use super::query_stats::{GovernorStats, QueryCounters};
use super::GovernorConfig;

const MANUAL_INVESTIGATION: &str =
    "Composite index suggestion has no executable DDL; manual investigation needed";

struct GovernorInner {
    config: GovernorConfig,
    pool: Arc<ConnectionPool>,
    cache: Option<ResultCache>,
    monitor: PerformanceMonitor,
    analyzer: PlanAnalyzer,
    advisor: IndexAdvisor,
    counters: QueryCounters,
    closed: AtomicBool,
    logger: Logger,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct QueryGovernor {
    inner: Arc<GovernorInner>,
}

impl QueryGovernor {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: GovernorConfig) -> GovernorResult<Self> {
        QueryGovernorBuilder::new().with_config(config).build(factory)
    }

    pub fn builder() -> QueryGovernorBuilder {
        QueryGovernorBuilder::new()
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Open the configured minimum of idle connections.
    pub async fn warm_up(&self) -> GovernorResult<u32> {
        self.inner.pool.warm_up().await
    }

    /// Run `query` with `params`, serving reads from the cache when possible.
    ///
    /// Callers only ever see timeout, connection or backend errors. A timed-out
    /// statement is abandoned, not cancelled, and may still finish on the backend.
    ///
    /// Deep analysis follows successful executions only. For a timed-out statement
    /// `EXPLAIN ANALYZE` would run it again past a deadline it already missed, so
    /// timeouts are counted and recorded but never analyzed.
    pub async fn execute(
        &self,
        query: &str,
        params: &[Value],
        options: ExecuteOptions,
    ) -> GovernorResult<Vec<Row>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(GovernorError::connection_error("Query governor is closed"));
        }
        inner.counters.record_query();

        let fingerprint = match &inner.cache {
            Some(_) if !options.skip_cache && is_cacheable_statement(query) => {
                Some(QueryFingerprint::compute(query, params))
            }
            _ => None,
        };

        if let (Some(cache), Some(fp)) = (&inner.cache, &fingerprint) {
            match cache.get(fp).await {
                Ok(Some(rows)) => {
                    inner.counters.record_cache_hit();
                    return Ok(rows);
                }
                Ok(None) => inner.counters.record_cache_miss(),
                Err(e) => {
                    inner.counters.record_cache_miss();
                    inner.counters.record_cache_error();
                    inner.logger.warn_with_meta(
                        "Cache lookup failed, executing uncached",
                        Some(&serde_json::json!({ "fingerprint": fp.as_str(), "error": e.message })),
                    );
                }
            }
        }

        let timeout_ms = inner.config.effective_timeout_ms(options.timeout_ms);
        let started = Instant::now();
        let outcome = self.run_with_deadline(query, params, timeout_ms).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        inner.counters.record_execution();
        let execution = match &outcome {
            Ok(_) => ExecutionOutcome::Success,
            Err(e) if e.kind == ErrorKind::TimeoutError => ExecutionOutcome::Timeout,
            Err(_) => ExecutionOutcome::Failed,
        };
        let recorded = inner.monitor.record(query, elapsed_ms, execution);

        let rows = match outcome {
            Ok(rows) => rows,
            Err(e) => {
                match e.kind {
                    ErrorKind::TimeoutError => inner.counters.record_timeout(),
                    ErrorKind::BackendError => inner.counters.record_backend_error(),
                    _ => {}
                }
                return Err(e);
            }
        };

        if let (Some(cache), Some(fp)) = (&inner.cache, &fingerprint) {
            let ttl = options
                .cache_ttl
                .unwrap_or_else(|| Duration::from_secs(inner.config.default_cache_ttl_seconds));
            if let Err(e) = cache.set(fp, rows.clone(), ttl).await {
                inner.counters.record_cache_error();
                inner.logger.warn_with_meta(
                    "Cache store failed, result not cached",
                    Some(&serde_json::json!({ "fingerprint": fp.as_str(), "error": e.message })),
                );
            }
        }

        if inner.config.enable_plan_analysis
            && elapsed_ms > inner.config.deep_analysis_threshold_ms as f64
        {
            self.spawn_deep_analysis(query, params, recorded.signature, elapsed_ms);
        }

        Ok(rows)
    }

    /// Race a detached execution task against the caller deadline.
    async fn run_with_deadline(
        &self,
        query: &str,
        params: &[Value],
        timeout_ms: u64,
    ) -> GovernorResult<Vec<Row>> {
        let abandoned = Arc::new(AtomicBool::new(false));
        let task = {
            let pool = Arc::clone(&self.inner.pool);
            let abandoned = Arc::clone(&abandoned);
            let statement_timeout = Duration::from_millis(self.inner.config.statement_timeout_ms);
            let sql = query.to_string();
            let params = params.to_vec();
            tokio::spawn(async move {
                let mut conn = pool.acquire().await?;
                if abandoned.load(Ordering::SeqCst) {
                    return Err(GovernorError::internal_error(
                        "Caller gave up before a connection was available",
                    ));
                }
                conn.query_bounded(&sql, &params, statement_timeout).await
            })
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(GovernorError::backend_error(format!(
                "Backend execution task failed: {}",
                join_error
            ))),
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                Err(GovernorError::timeout_error(timeout_ms))
            }
        }
    }

    /// Analysis runs on its own task so the caller already has its rows. Errors and
    /// panics end there.
    fn spawn_deep_analysis(
        &self,
        query: &str,
        params: &[Value],
        signature: QuerySignature,
        elapsed_ms: f64,
    ) {
        let inner = Arc::clone(&self.inner);
        let query = query.to_string();
        let params = params.to_vec();

        tokio::spawn(async move {
            inner.logger.info_with_meta(
                "Starting deep analysis",
                Some(&serde_json::json!({
                    "signature": signature.as_str(),
                    "elapsed_ms": elapsed_ms,
                    "dialect": inner.analyzer.dialect(),
                })),
            );

            let analysis = AssertUnwindSafe(inner.deep_analysis(&query, &params, &signature))
                .catch_unwind()
                .await;

            match analysis {
                Ok(Ok(suggested)) => {
                    inner.counters.record_analysis(true);
                    inner.logger.debug(&format!(
                        "Deep analysis produced {} index suggestions",
                        suggested
                    ));
                }
                Ok(Err(e)) => {
                    inner.counters.record_analysis(false);
                    inner.logger.add_error(
                        "Deep analysis failed",
                        &e,
                        Some(&serde_json::json!({
                            "signature": signature.as_str(),
                            "kind": e.kind.as_str(),
                        })),
                    );
                }
                Err(_) => {
                    inner.counters.record_analysis(false);
                    inner.logger.error_with_meta(
                        "Deep analysis panicked",
                        Some(&serde_json::json!({ "signature": signature.as_str() })),
                    );
                }
            }
        });
    }

    pub fn snapshot(&self) -> GovernorStats {
        let inner = &self.inner;
        GovernorStats::assemble(
            inner.counters.values(),
            &inner.monitor.summary(),
            inner.advisor.suggestion_count(),
            inner.pool.snapshot(),
        )
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.inner.pool.snapshot()
    }

    pub fn pending_suggestions(&self, limit: usize) -> Vec<IndexSuggestion> {
        self.inner.advisor.pending(limit)
    }

    pub fn signature_stats(&self) -> Vec<SignatureStats> {
        self.inner.monitor.signature_stats()
    }

    pub fn top_slow_signatures(&self, limit: usize) -> Vec<SignatureStats> {
        self.inner.monitor.top_slow_signatures(limit)
    }

    /// Issue each suggestion's DDL. Re-applying an existing index reports `exists`.
    pub async fn apply_recommended_indexes(
        &self,
        suggestions: &[IndexSuggestion],
    ) -> GovernorResult<Vec<IndexApplyResult>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(GovernorError::connection_error("Query governor is closed"));
        }

        let mut results = Vec::with_capacity(suggestions.len());
        for suggestion in suggestions {
            let result = if suggestion.is_executable() {
                self.apply_ddl(&suggestion.ddl).await
            } else {
                IndexApplyResult::failed(&suggestion.ddl, MANUAL_INVESTIGATION)
            };

            if result.error.is_none() {
                inner.advisor.mark_applied(&suggestion.ddl);
            }
            inner.logger.info_with_meta(
                "Index DDL applied",
                Some(&serde_json::json!({
                    "ddl": result.ddl,
                    "status": result.status,
                    "error": result.error,
                })),
            );
            results.push(result);
        }
        Ok(results)
    }

    async fn apply_ddl(&self, ddl: &str) -> IndexApplyResult {
        let mut conn = match self.inner.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return IndexApplyResult::failed(ddl, e.message),
        };
        match conn.execute_ddl(ddl).await {
            Ok(()) => IndexApplyResult::created(ddl),
            Err(e) if e.message.to_lowercase().contains("already exists") => {
                IndexApplyResult::exists(ddl)
            }
            Err(e) => IndexApplyResult::failed(ddl, e.message),
        }
    }

    /// Drop every cached result.
    pub async fn invalidate_cache(&self) -> GovernorResult<()> {
        match &self.inner.cache {
            Some(cache) => cache.invalidate_all().await,
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work and close the pool. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pool.close();
        let stats = self.snapshot();
        self.inner.logger.info_with_meta(
            "Query governor closed",
            Some(&serde_json::json!({
                "total_queries": stats.total_queries,
                "slow_queries": stats.slow_queries,
                "suggestions": stats.suggestion_count,
            })),
        );
    }
}

impl GovernorInner {
    async fn deep_analysis(
        &self,
        query: &str,
        params: &[Value],
        signature: &QuerySignature,
    ) -> GovernorResult<usize> {
        let analysis = self.analyzer.analyze(query, params).await?;
        for warning in &analysis.warnings {
            self.logger.warn_with_meta(
                "Plan warning",
                Some(&serde_json::json!({ "signature": signature.as_str(), "warning": warning })),
            );
        }
        let recorded = self
            .advisor
            .suggest_and_record(query, signature.as_str(), &analysis);
        Ok(recorded.len())
    }
}

/// Builder pattern for creating a query governor
pub struct QueryGovernorBuilder {
    config: GovernorConfig,
    cache_store: Option<Arc<dyn CacheStore>>,
    plan_parser: Option<Arc<dyn PlanParser>>,
}

impl QueryGovernorBuilder {
    pub fn new() -> Self {
        Self {
            config: GovernorConfig::default(),
            cache_store: None,
            plan_parser: None,
        }
    }

    pub fn with_config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn with_plan_parser(mut self, parser: Arc<dyn PlanParser>) -> Self {
        self.plan_parser = Some(parser);
        self
    }

    pub fn build(self, factory: Arc<dyn ConnectionFactory>) -> GovernorResult<QueryGovernor> {
        let config = self.config;
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(factory, config.pool.clone()));
        let store: Arc<dyn CacheStore> = match self.cache_store {
            Some(store) => store,
            None => Arc::new(InMemoryCacheStore::new()),
        };
        let cache = config.enable_query_cache.then(|| ResultCache::new(store));
        let parser: Arc<dyn PlanParser> = match self.plan_parser {
            Some(parser) => parser,
            None => Arc::new(PostgresPlanParser::new(config.seq_scan_row_threshold)),
        };

        let logger = Logger::for_component("query_governor");
        logger.info_with_meta(
            "Query governor started",
            Some(&serde_json::json!({
                "dialect": parser.dialect(),
                "max_connections": config.pool.max_connections,
                "query_timeout_ms": config.query_timeout_ms,
                "slow_query_threshold_ms": config.slow_query_threshold_ms,
                "deep_analysis_threshold_ms": config.deep_analysis_threshold_ms,
                "cache_enabled": cache.is_some(),
            })),
        );

        Ok(QueryGovernor {
            inner: Arc::new(GovernorInner {
                monitor: PerformanceMonitor::new(
                    config.slow_query_threshold_ms,
                    config.max_signature_length,
                    config.latency_sample_size,
                ),
                analyzer: PlanAnalyzer::new(Arc::clone(&pool), parser),
                advisor: IndexAdvisor::new(config.deduplicate_suggestions),
                counters: QueryCounters::new(),
                closed: AtomicBool::new(false),
                config,
                pool,
                cache,
                logger,
            }),
        })
    }
}

impl Default for QueryGovernorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
