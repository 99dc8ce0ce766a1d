// Result Cache - fingerprinted read results with lazy TTL expiry
// Entries are serialized to JSON so any key/value store can back the cache

use crate::types::Row;
use crate::utils::{current_timestamp_ms, lock_or_recover, GovernorError, GovernorResult, Logger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheStoreError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type CacheStoreResult<T> = Result<T, CacheStoreError>;

/// Backing store for serialized cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheStoreResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheStoreResult<()>;
    async fn remove(&self, key: &str) -> CacheStoreResult<()>;
    async fn clear(&self) -> CacheStoreResult<()>;
}

struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// Process-local store. Every `set` also drops entries whose TTL has passed, so
/// fingerprints that are never read again do not pile up.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> CacheStoreResult<Option<String>> {
        let mut entries = lock_or_recover(&self.entries);
        match entries.get(key) {
            Some(stored) if stored.expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheStoreResult<()> {
        let now = Instant::now();
        let mut entries = lock_or_recover(&self.entries);
        entries.retain(|_, stored| stored.expires_at > now);
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheStoreResult<()> {
        lock_or_recover(&self.entries).remove(key);
        Ok(())
    }

    async fn clear(&self) -> CacheStoreResult<()> {
        lock_or_recover(&self.entries).clear();
        Ok(())
    }
}

/// Hex SHA-256 over the query text and the canonical JSON of its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryFingerprint(String);

impl QueryFingerprint {
    pub fn compute(query: &str, params: &[Value]) -> Self {
        // serde_json renders a Value slice deterministically, objects with sorted keys
        let canonical_params = serde_json::to_string(params).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_params.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache entry with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub value: Vec<Row>,
    /// Milliseconds since Unix epoch
    pub created_at: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn new(fingerprint: &QueryFingerprint, value: Vec<Row>, ttl: Duration) -> Self {
        Self {
            fingerprint: fingerprint.as_str().to_string(),
            value,
            created_at: current_timestamp_ms(),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.created_at.saturating_add(self.ttl_ms)
    }
}

/// Statements whose results may be cached: plain reads only.
pub fn is_cacheable_statement(query: &str) -> bool {
    let first_keyword = query
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    let is_read = matches!(
        first_keyword.as_str(),
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "TABLE"
    );
    // SELECT ... FOR UPDATE and data-modifying CTEs take locks or write
    let upper = query.to_ascii_uppercase();
    is_read
        && !upper.contains(" FOR UPDATE")
        && !upper.contains(" FOR SHARE")
        && !(first_keyword == "WITH"
            && (upper.contains("INSERT ") || upper.contains("UPDATE ") || upper.contains("DELETE ")))
}

pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    logger: Logger,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            logger: Logger::for_component("query_cache"),
        }
    }

    /// Cached rows, or `None` on a miss. Expired or unreadable entries are misses
    /// and are removed from the store.
    pub async fn get(&self, fingerprint: &QueryFingerprint) -> GovernorResult<Option<Vec<Row>>> {
        let raw = match self.store.get(fingerprint.as_str()).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let entry = match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.fingerprint == fingerprint.as_str() => entry,
            Ok(_) | Err(_) => {
                self.logger.warn(&format!(
                    "Discarding unreadable cache entry {}",
                    fingerprint
                ));
                self.store.remove(fingerprint.as_str()).await?;
                return Ok(None);
            }
        };

        if entry.is_expired_at(current_timestamp_ms()) {
            self.store.remove(fingerprint.as_str()).await?;
            return Ok(None);
        }

        Ok(Some(entry.value))
    }

    /// Store rows under the fingerprint, replacing whatever was there.
    pub async fn set(
        &self,
        fingerprint: &QueryFingerprint,
        rows: Vec<Row>,
        ttl: Duration,
    ) -> GovernorResult<()> {
        let entry = CacheEntry::new(fingerprint, rows, ttl);
        let serialized = serde_json::to_string(&entry).map_err(|e| {
            GovernorError::cache_error(format!("Failed to serialize cache entry: {}", e))
        })?;
        self.store
            .set(fingerprint.as_str(), serialized, ttl)
            .await
            .map_err(GovernorError::from)
    }

    pub async fn invalidate_all(&self) -> GovernorResult<()> {
        self.store.clear().await?;
        self.logger.info("Result cache cleared");
        Ok(())
    }
}
