use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A single result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Ordered list of bound parameter values.
pub type QueryParams = Vec<Value>;

/// Per-call options for `QueryGovernor::execute`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Caller deadline; falls back to the configured query timeout
    pub timeout_ms: Option<u64>,
    /// Bypass the result cache for lookup and store
    pub skip_cache: bool,
    /// Lifetime of the cached result; falls back to the configured default TTL
    pub cache_ttl: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn with_cache_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.cache_ttl = Some(Duration::from_secs(ttl_seconds));
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// Outcome of applying one recommended index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexApplyStatus {
    Created,
    Exists,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexApplyResult {
    pub ddl: String,
    pub status: IndexApplyStatus,
    pub error: Option<String>,
}

impl IndexApplyResult {
    pub fn created(ddl: impl Into<String>) -> Self {
        Self {
            ddl: ddl.into(),
            status: IndexApplyStatus::Created,
            error: None,
        }
    }

    pub fn exists(ddl: impl Into<String>) -> Self {
        Self {
            ddl: ddl.into(),
            status: IndexApplyStatus::Exists,
            error: None,
        }
    }

    pub fn failed(ddl: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ddl: ddl.into(),
            status: IndexApplyStatus::Failed,
            error: Some(error.into()),
        }
    }
}
