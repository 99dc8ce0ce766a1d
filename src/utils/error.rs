// src/utils/error.rs

use crate::services::persistence_layer::backend::BackendFailure;
use crate::services::persistence_layer::query_cache::CacheStoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type GovernorResult<T> = Result<T, GovernorError>;

/// Custom error details for additional context
pub type ErrorDetails = HashMap<String, serde_json::Value>;

/// Main error type for the query governor.
/// Details are boxed to keep the error small on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorError {
    pub message: String,
    pub details: Option<Box<ErrorDetails>>,
    pub error_code: Option<String>,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Caller deadline exceeded
    TimeoutError,
    /// Pool exhaustion, closed pool or unreachable backend
    ConnectionError,
    /// Statement rejected by the backend (syntax, constraint, ...)
    BackendError,
    /// Plan retrieval or parsing failed
    AnalysisError,
    /// Result cache store failed
    CacheError,
    ConfigurationError,
    SerializationError,
    #[default]
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::BackendError => "BACKEND_ERROR",
            ErrorKind::AnalysisError => "ANALYSIS_ERROR",
            ErrorKind::CacheError => "CACHE_ERROR",
            ErrorKind::ConfigurationError => "CONFIG_ERROR",
            ErrorKind::SerializationError => "SERIALIZATION_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for GovernorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GovernorError {}

impl GovernorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            error_code: None,
            kind,
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(Box::new(details));
        self
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value);
        self
    }

    pub fn with_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    /// Only timeouts, connection failures and backend errors ever reach a caller of
    /// `execute`; everything else is absorbed inside the governor.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TimeoutError | ErrorKind::ConnectionError | ErrorKind::BackendError
        )
    }

    pub fn detail(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.as_ref().and_then(|d| d.get(key))
    }

    pub fn timeout_error(timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::TimeoutError,
            format!("Query exceeded timeout of {}ms", timeout_ms),
        )
        .with_code("TIMEOUT_ERROR")
        .with_detail("timeout_ms", serde_json::json!(timeout_ms))
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionError, message).with_code("CONNECTION_ERROR")
    }

    pub fn pool_exhausted(max_connections: u32, waited_ms: u64) -> Self {
        Self::connection_error(format!(
            "Connection pool exhausted: no connection out of {} became free within {}ms",
            max_connections, waited_ms
        ))
        .with_code("POOL_EXHAUSTED")
        .with_detail("max_connections", serde_json::json!(max_connections))
        .with_detail("waited_ms", serde_json::json!(waited_ms))
    }

    /// Backend messages pass through unchanged.
    pub fn backend_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendError, message).with_code("BACKEND_ERROR")
    }

    pub fn analysis_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AnalysisError, message).with_code("ANALYSIS_ERROR")
    }

    pub fn cache_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CacheError, message).with_code("CACHE_ERROR")
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message).with_code("CONFIG_ERROR")
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SerializationError, message).with_code("SERIALIZATION_ERROR")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message).with_code("INTERNAL_ERROR")
    }
}

impl From<serde_json::Error> for GovernorError {
    fn from(err: serde_json::Error) -> Self {
        GovernorError::serialization_error(format!("JSON serialization error: {}", err))
    }
}

impl From<BackendFailure> for GovernorError {
    fn from(err: BackendFailure) -> Self {
        match err {
            BackendFailure::Connection(msg) => GovernorError::connection_error(msg),
            BackendFailure::Closed => GovernorError::connection_error("Backend connection closed"),
            BackendFailure::Statement(msg) => GovernorError::backend_error(msg),
        }
    }
}

impl From<CacheStoreError> for GovernorError {
    fn from(err: CacheStoreError) -> Self {
        GovernorError::cache_error(format!("Result cache failure: {}", err))
    }
}

// Helper macro for creating errors with context
#[macro_export]
macro_rules! governor_error {
    ($kind:expr, $msg:expr) => {
        $crate::utils::error::GovernorError::new($kind, $msg)
    };
    ($kind:expr, $msg:expr, $($key:expr => $value:expr),+) => {{
        let mut details = std::collections::HashMap::new();
        $(
            details.insert($key.to_string(), serde_json::json!($value));
        )+
        $crate::utils::error::GovernorError::new($kind, $msg).with_details(details)
    }};
}
