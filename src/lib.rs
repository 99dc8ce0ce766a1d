//! Query Performance Governor
//!
//! Sits between application code and a relational SQL backend. Reads are served
//! from a fingerprinted result cache, every execution is timed and grouped under a
//! literal-free signature, and statements that run past the deep-analysis
//! threshold get their plan inspected for index suggestions.
//!
//! The backend itself is supplied through [`ConnectionFactory`] and
//! [`BackendConnection`]; plan text is interpreted by a [`PlanParser`] dialect.

// Module declarations
pub mod services;
pub mod types;
pub mod utils;

pub use services::persistence_layer::{
    percentile, BackendConnection, BackendFailure, BackendResult, CacheStore, CacheStoreError,
    ConnectionFactory, GovernorConfig, GovernorStats, IndexKind, IndexSuggestion,
    InMemoryCacheStore, PlanAnalysis, PlanParser, PoolConfig, PoolSnapshot,
    PostgresPlanParser, QueryGovernor, QueryGovernorBuilder, ScanType, SignatureStats,
    SqlitePlanParser, SuggestionPriority,
};
pub use types::{ExecuteOptions, IndexApplyResult, IndexApplyStatus, QueryParams, Row};
pub use utils::{ErrorKind, GovernorError, GovernorResult};
