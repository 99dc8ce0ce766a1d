// Persistence Layer - Query Performance Governor
// Caching, latency accounting, plan analysis and index advice in front of a SQL backend

pub mod backend;
pub mod connection_pool;
pub mod index_advisor;
pub mod performance_monitor;
pub mod plan_analyzer;
pub mod query_cache;
pub mod query_governor;
pub mod query_stats;

pub use backend::{BackendConnection, BackendFailure, BackendResult, ConnectionFactory};
pub use connection_pool::{ConnectionPool, ConnectionStats, PoolSnapshot, PooledConnection};
pub use index_advisor::{IndexAdvisor, IndexKind, IndexSuggestion, SourceTable, SuggestionPriority};
pub use performance_monitor::{
    ExecutionOutcome, PerformanceMonitor, QuerySignature, RecorderSummary, SignatureStats,
};
pub use plan_analyzer::{
    PlanAnalysis, PlanAnalyzer, PlanParser, PostgresPlanParser, ScanType, SqlitePlanParser,
};
pub use query_cache::{
    is_cacheable_statement, CacheEntry, CacheStore, CacheStoreError, CacheStoreResult,
    InMemoryCacheStore, QueryFingerprint, ResultCache,
};
pub use query_governor::{QueryGovernor, QueryGovernorBuilder};
pub use query_stats::{percentile, CounterValues, GovernorStats, QueryCounters};

use crate::utils::{GovernorError, GovernorResult};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "QUERY_GOVERNOR_";

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Connections opened by `warm_up`
    pub min_idle_connections: u32,
    /// Longest a caller waits in the pool queue before a connection error
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_idle_connections: 0,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Every recognized governor option with its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Default caller deadline
    pub query_timeout_ms: u64,
    /// Hard per-statement bound enforced on the pooled connection
    pub statement_timeout_ms: u64,
    /// Executions above this are counted as slow
    pub slow_query_threshold_ms: u64,
    /// Executions above this trigger plan analysis and index advice
    pub deep_analysis_threshold_ms: u64,
    pub enable_query_cache: bool,
    pub default_cache_ttl_seconds: u64,
    pub enable_plan_analysis: bool,
    /// Signatures longer than this are truncated and may collide
    pub max_signature_length: usize,
    /// Recent latencies kept for percentiles
    pub latency_sample_size: usize,
    /// Drop suggestions whose DDL is already in the log
    pub deduplicate_suggestions: bool,
    /// Sequential scans estimated above this many rows raise a plan warning
    pub seq_scan_row_threshold: u64,
    pub pool: PoolConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 25_000,
            statement_timeout_ms: 30_000,
            slow_query_threshold_ms: 1_000,
            deep_analysis_threshold_ms: 5_000,
            enable_query_cache: true,
            default_cache_ttl_seconds: 300, // 5 minutes
            enable_plan_analysis: true,
            max_signature_length: 200,
            latency_sample_size: 1_000,
            deduplicate_suggestions: false,
            seq_scan_row_threshold: 1_000,
            pool: PoolConfig::default(),
        }
    }
}

impl GovernorConfig {
    /// Defaults overlaid with `QUERY_GOVERNOR_*` environment variables.
    pub fn from_env() -> GovernorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> GovernorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = read("QUERY_TIMEOUT_MS") {
            config.query_timeout_ms = parse_var("QUERY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = read("STATEMENT_TIMEOUT_MS") {
            config.statement_timeout_ms = parse_var("STATEMENT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = read("SLOW_QUERY_THRESHOLD_MS") {
            config.slow_query_threshold_ms = parse_var("SLOW_QUERY_THRESHOLD_MS", &v)?;
        }
        if let Some(v) = read("DEEP_ANALYSIS_THRESHOLD_MS") {
            config.deep_analysis_threshold_ms = parse_var("DEEP_ANALYSIS_THRESHOLD_MS", &v)?;
        }
        if let Some(v) = read("ENABLE_QUERY_CACHE") {
            config.enable_query_cache = parse_var("ENABLE_QUERY_CACHE", &v)?;
        }
        if let Some(v) = read("DEFAULT_CACHE_TTL_SECONDS") {
            config.default_cache_ttl_seconds = parse_var("DEFAULT_CACHE_TTL_SECONDS", &v)?;
        }
        if let Some(v) = read("ENABLE_PLAN_ANALYSIS") {
            config.enable_plan_analysis = parse_var("ENABLE_PLAN_ANALYSIS", &v)?;
        }
        if let Some(v) = read("MAX_SIGNATURE_LENGTH") {
            config.max_signature_length = parse_var("MAX_SIGNATURE_LENGTH", &v)?;
        }
        if let Some(v) = read("LATENCY_SAMPLE_SIZE") {
            config.latency_sample_size = parse_var("LATENCY_SAMPLE_SIZE", &v)?;
        }
        if let Some(v) = read("DEDUPLICATE_SUGGESTIONS") {
            config.deduplicate_suggestions = parse_var("DEDUPLICATE_SUGGESTIONS", &v)?;
        }
        if let Some(v) = read("SEQ_SCAN_ROW_THRESHOLD") {
            config.seq_scan_row_threshold = parse_var("SEQ_SCAN_ROW_THRESHOLD", &v)?;
        }
        if let Some(v) = read("POOL_MAX_CONNECTIONS") {
            config.pool.max_connections = parse_var("POOL_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = read("POOL_MIN_IDLE_CONNECTIONS") {
            config.pool.min_idle_connections = parse_var("POOL_MIN_IDLE_CONNECTIONS", &v)?;
        }
        if let Some(v) = read("POOL_ACQUIRE_TIMEOUT_MS") {
            config.pool.acquire_timeout_ms = parse_var("POOL_ACQUIRE_TIMEOUT_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> GovernorResult<()> {
        if self.pool.max_connections == 0 {
            return Err(GovernorError::config_error(
                "pool.max_connections must be greater than 0",
            ));
        }
        if self.pool.min_idle_connections > self.pool.max_connections {
            return Err(GovernorError::config_error(
                "pool.min_idle_connections cannot exceed pool.max_connections",
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(GovernorError::config_error(
                "query_timeout_ms must be greater than 0",
            ));
        }
        if self.query_timeout_ms > self.statement_timeout_ms {
            return Err(GovernorError::config_error(format!(
                "query_timeout_ms ({}) must not exceed statement_timeout_ms ({})",
                self.query_timeout_ms, self.statement_timeout_ms
            )));
        }
        if self.deep_analysis_threshold_ms < self.slow_query_threshold_ms {
            return Err(GovernorError::config_error(format!(
                "deep_analysis_threshold_ms ({}) must be at least slow_query_threshold_ms ({})",
                self.deep_analysis_threshold_ms, self.slow_query_threshold_ms
            )));
        }
        if self.max_signature_length == 0 {
            return Err(GovernorError::config_error(
                "max_signature_length must be greater than 0",
            ));
        }
        if self.latency_sample_size == 0 {
            return Err(GovernorError::config_error(
                "latency_sample_size must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Caller deadline for one execution, never above the statement timeout.
    pub fn effective_timeout_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.query_timeout_ms)
            .min(self.statement_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> GovernorResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        GovernorError::config_error(format!(
            "Invalid value for {}{}: {:?}",
            ENV_PREFIX, name, value
        ))
    })
}
