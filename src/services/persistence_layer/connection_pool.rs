//! Connection Pool for the Query Governor
//!
//! Bounded pool of backend sessions. Admission is a fair FIFO semaphore: callers
//! beyond `max_connections` queue in arrival order and give up with a connection
//! error after `acquire_timeout_ms`. Sessions are checked out as
//! [`PooledConnection`] guards that return themselves to the idle list on drop.

use crate::types::Row;
use crate::utils::{lock_or_recover, GovernorError, GovernorResult, Logger};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::backend::{BackendConnection, ConnectionFactory};
use super::PoolConfig;

/// Read-only occupancy view, recomputed on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Open sessions, checked out or idle
    pub total: u32,
    pub idle: u32,
    /// Callers queued for a session
    pub waiting: u32,
    pub max: u32,
}

/// Lifetime counters for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connections_created: u64,
    pub connections_discarded: u64,
    pub acquire_timeouts: u64,
    pub connect_failures: u64,
}

pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn BackendConnection>>>,
    open_connections: AtomicU32,
    waiting: AtomicU32,
    connections_created: AtomicU64,
    connections_discarded: AtomicU64,
    acquire_timeouts: AtomicU64,
    connect_failures: AtomicU64,
    closed: AtomicBool,
    logger: Logger,
}

/// Decrements the waiting gauge however the acquire future ends, including
/// being dropped by a caller deadline.
struct WaitGuard<'a>(&'a AtomicU32);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            idle: Mutex::new(Vec::new()),
            open_connections: AtomicU32::new(0),
            waiting: AtomicU32::new(0),
            connections_created: AtomicU64::new(0),
            connections_discarded: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            logger: Logger::for_component("connection_pool"),
        }
    }

    /// Open `min_idle_connections` sessions ahead of traffic.
    pub async fn warm_up(&self) -> GovernorResult<u32> {
        let mut opened = 0;
        while self.idle_count() < self.config.min_idle_connections
            && self.open_connections.load(Ordering::SeqCst) < self.config.max_connections
        {
            let conn = self.open_connection().await?;
            lock_or_recover(&self.idle).push(conn);
            opened += 1;
        }

        if opened > 0 {
            self.logger
                .info(&format!("Warmed connection pool with {} sessions", opened));
        }
        Ok(opened)
    }

    /// Check out a session, waiting at the back of the queue if the pool is full.
    pub async fn acquire(self: &Arc<Self>) -> GovernorResult<PooledConnection> {
        if self.is_closed() {
            return Err(GovernorError::connection_error("Connection pool is closed"));
        }

        let wait_started = Instant::now();
        let acquire_timeout = Duration::from_millis(self.config.acquire_timeout_ms);

        let permit = {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _waiting = WaitGuard(&self.waiting);
            tokio::time::timeout(acquire_timeout, self.semaphore.clone().acquire_owned()).await
        };

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GovernorError::connection_error("Connection pool is closed"));
            }
            Err(_) => {
                self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                let waited_ms = wait_started.elapsed().as_millis() as u64;
                self.logger.warn_with_meta(
                    "Connection pool exhausted",
                    Some(&serde_json::json!({
                        "max_connections": self.config.max_connections,
                        "waited_ms": waited_ms,
                    })),
                );
                return Err(GovernorError::pool_exhausted(
                    self.config.max_connections,
                    waited_ms,
                ));
            }
        };

        let conn = match self.take_idle() {
            Some(conn) => conn,
            None => self.open_connection().await?,
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
            discard: false,
            _permit: permit,
        })
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            total: self.open_connections.load(Ordering::SeqCst),
            idle: self.idle_count(),
            waiting: self.waiting.load(Ordering::SeqCst),
            max: self.config.max_connections,
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop admitting callers and drop idle sessions. Queued callers fail with a
    /// connection error; checked-out sessions are dropped when their guard is.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.semaphore.close();

        let drained: Vec<_> = lock_or_recover(&self.idle).drain(..).collect();
        self.open_connections
            .fetch_sub(drained.len() as u32, Ordering::SeqCst);
        self.logger.info(&format!(
            "Connection pool closed, dropped {} idle sessions",
            drained.len()
        ));
    }

    fn idle_count(&self) -> u32 {
        lock_or_recover(&self.idle).len() as u32
    }

    /// Most recently returned healthy session; unhealthy ones are dropped on the way.
    fn take_idle(&self) -> Option<Box<dyn BackendConnection>> {
        let mut idle = lock_or_recover(&self.idle);
        while let Some(conn) = idle.pop() {
            if conn.is_healthy() {
                return Some(conn);
            }
            self.forget_connection();
        }
        None
    }

    async fn open_connection(&self) -> GovernorResult<Box<dyn BackendConnection>> {
        match self.factory.connect().await {
            Ok(conn) => {
                self.open_connections.fetch_add(1, Ordering::SeqCst);
                self.connections_created.fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            Err(failure) => {
                self.connect_failures.fetch_add(1, Ordering::Relaxed);
                self.logger.error(&format!(
                    "Failed to open backend connection: {}",
                    failure
                ));
                Err(GovernorError::connection_error(format!(
                    "Failed to open backend connection: {}",
                    failure
                )))
            }
        }
    }

    fn release(&self, conn: Box<dyn BackendConnection>, discard: bool) {
        if discard || self.is_closed() || !conn.is_healthy() {
            self.forget_connection();
            return;
        }
        lock_or_recover(&self.idle).push(conn);
    }

    fn forget_connection(&self) {
        self.open_connections.fetch_sub(1, Ordering::SeqCst);
        self.connections_discarded.fetch_add(1, Ordering::Relaxed);
    }
}

/// A checked-out session. Returned to the pool on drop unless marked for discard.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Box<dyn BackendConnection>>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Never return this session to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    fn session(&mut self) -> GovernorResult<&mut Box<dyn BackendConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| GovernorError::internal_error("Pooled connection already released"))
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> GovernorResult<Vec<Row>> {
        let outcome = self.session()?.query(sql, params).await;
        outcome.map_err(|failure| {
            if failure.is_connection_failure() {
                self.discard = true;
            }
            failure.into()
        })
    }

    /// `query` under the pool's hard statement bound. A session that overran the
    /// bound is discarded since its backend-side state is unknown.
    pub async fn query_bounded(
        &mut self,
        sql: &str,
        params: &[Value],
        statement_timeout: Duration,
    ) -> GovernorResult<Vec<Row>> {
        let outcome = tokio::time::timeout(statement_timeout, self.query(sql, params)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.discard = true;
                Err(
                    GovernorError::timeout_error(statement_timeout.as_millis() as u64)
                        .with_code("STATEMENT_TIMEOUT"),
                )
            }
        }
    }

    pub async fn explain(&mut self, sql: &str, params: &[Value]) -> GovernorResult<String> {
        let outcome = self.session()?.explain(sql, params).await;
        outcome.map_err(|failure| {
            if failure.is_connection_failure() {
                self.discard = true;
            }
            failure.into()
        })
    }

    pub async fn execute_ddl(&mut self, sql: &str) -> GovernorResult<()> {
        let outcome = self.session()?.execute_ddl(sql).await;
        outcome.map_err(|failure| {
            if failure.is_connection_failure() {
                self.discard = true;
            }
            failure.into()
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.discard);
        }
    }
}
