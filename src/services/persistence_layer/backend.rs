//! Backend collaborator contracts
//!
//! The governor never speaks a wire protocol itself. A driver adapter implements
//! [`ConnectionFactory`] and [`BackendConnection`] for the relational backend in use.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::Row;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    /// Backend unreachable or the connection broke mid-operation
    #[error("Connection failure: {0}")]
    Connection(String),
    /// Statement rejected by the backend; message is the backend's own
    #[error("{0}")]
    Statement(String),
    #[error("Connection closed")]
    Closed,
}

impl BackendFailure {
    /// Connection-class failures make the connection unfit for reuse.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, BackendFailure::Connection(_) | BackendFailure::Closed)
    }
}

pub type BackendResult<T> = Result<T, BackendFailure>;

/// One live session against the backend.
#[async_trait]
pub trait BackendConnection: Send {
    /// Parameterized query execution
    async fn query(&mut self, sql: &str, params: &[Value]) -> BackendResult<Vec<Row>>;

    /// Runs a diagnostic plan statement and returns its textual output, one plan
    /// line per line.
    async fn explain(&mut self, sql: &str, params: &[Value]) -> BackendResult<String>;

    /// DDL execution
    async fn execute_ddl(&mut self, sql: &str) -> BackendResult<()>;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens new backend sessions for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> BackendResult<Box<dyn BackendConnection>>;
}
