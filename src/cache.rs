//! Best-effort result cache.
//!
//! The cache only ever saves work: every failure is logged and treated as
//! a miss (on read) or ignored (on write), and a query never fails
//! because of it. Values are the serialized result lists.
//!
//! Backends:
//! - [`RedisCache`]: shared across replicas; `GET` / `SETEX` with a
//!   per-operation timeout.
//! - [`MemoryCache`]: in-process map with time-based expiry.
//! - [`NoCache`]: always misses.
//!
//! Keys embed the active generation id, so results computed against a
//! retired index are never served after a swap.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{CacheBackend, CacheConfig};

/// Cache availability as reported by the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Ok,
    Unavailable,
    Disabled,
}

#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Cached value for `key`, or `None` on miss, expiry or any error.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`. Errors are swallowed.
    async fn put(&self, key: &str, value: &str);

    fn status(&self) -> CacheStatus;
}

/// Collapse runs of whitespace and trim, so trivially different spellings
/// of a query share one cache entry and one embedding.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `{prefix}{generation}:{sha256(normalized, max_results, rerank)}`.
pub fn cache_key(
    prefix: &str,
    generation: Uuid,
    normalized_query: &str,
    max_results: usize,
    rerank: bool,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    hasher.update([0u8]);
    hasher.update(max_results.to_le_bytes());
    hasher.update([rerank as u8]);
    format!("{}{}:{}", prefix, generation.simple(), hex::encode(hasher.finalize()))
}

/// Build the configured cache backend.
pub fn create_cache(config: &CacheConfig) -> Arc<dyn CacheLayer> {
    match config.backend {
        CacheBackend::Redis => match RedisCache::new(config) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                error!(url = %config.url, error = %e, "Invalid Redis URL; caching disabled");
                Arc::new(NoCache)
            }
        },
        CacheBackend::Memory => Arc::new(MemoryCache::new(Duration::from_secs(config.ttl_secs))),
        CacheBackend::Disabled => Arc::new(NoCache),
    }
}

// ============ Redis ============

pub struct RedisCache {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    ttl_secs: u64,
    timeout: Duration,
    healthy: AtomicBool,
}

impl RedisCache {
    pub fn new(config: &CacheConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: tokio::sync::Mutex::new(None),
            ttl_secs: config.ttl_secs,
            timeout: Duration::from_millis(config.timeout_ms),
            healthy: AtomicBool::new(true),
        })
    }

    /// Shared multiplexed connection, opened on first use and reopened
    /// after a failure.
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, String> {
        let mut slot = self.connection.lock().await;
        if let Some(ref conn) = *slot {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| "connect timed out".to_string())?
            .map_err(|e| format!("Redis connection failed: {}", e))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self, op: &str, reason: &str) {
        warn!(op, error = %reason, "Cache operation failed; continuing without cache");
        self.healthy.store(false, Ordering::Relaxed);
        *self.connection.lock().await = None;
    }

    async fn try_get(&self, key: &str) -> Result<Option<String>, String> {
        let mut conn = self.connection().await?;
        tokio::time::timeout(
            self.timeout,
            redis::cmd("GET").arg(key).query_async::<Option<String>>(&mut conn),
        )
        .await
        .map_err(|_| "GET timed out".to_string())?
        .map_err(|e| format!("Redis GET failed: {}", e))
    }

    async fn try_put(&self, key: &str, value: &str) -> Result<(), String> {
        let mut conn = self.connection().await?;
        tokio::time::timeout(
            self.timeout,
            redis::cmd("SETEX")
                .arg(key)
                .arg(self.ttl_secs)
                .arg(value)
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| "SETEX timed out".to_string())?
        .map_err(|e| format!("Redis SETEX failed: {}", e))
    }
}

#[async_trait]
impl CacheLayer for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        match self.try_get(key).await {
            Ok(value) => {
                self.healthy.store(true, Ordering::Relaxed);
                value
            }
            Err(e) => {
                self.reset("get", &e).await;
                None
            }
        }
    }

    async fn put(&self, key: &str, value: &str) {
        match self.try_put(key, value).await {
            Ok(()) => {
                self.healthy.store(true, Ordering::Relaxed);
                debug!(ttl = self.ttl_secs, "Result cached in Redis");
            }
            Err(e) => self.reset("put", &e).await,
        }
    }

    fn status(&self) -> CacheStatus {
        if self.healthy.load(Ordering::Relaxed) {
            CacheStatus::Ok
        } else {
            CacheStatus::Unavailable
        }
    }
}

// ============ In-process ============

/// Entries are dropped only when read after expiry or swept on insert.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Instant, String)>>,
    ttl: Duration,
}

/// Sweep expired entries once the map grows past this many.
const SWEEP_THRESHOLD: usize = 1024;

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl CacheLayer for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Memory cache lock poisoned; treating as miss");
                return None;
            }
        };
        match entries.get(key) {
            Some((expires_at, _)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((_, value)) => Some(value.clone()),
            None => None,
        }
    }

    async fn put(&self, key: &str, value: &str) {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Memory cache lock poisoned; skipping write");
            return;
        };
        let now = Instant::now();
        if entries.len() >= SWEEP_THRESHOLD {
            entries.retain(|_, (expires_at, _)| *expires_at > now);
        }
        entries.insert(key.to_string(), (now + self.ttl, value.to_string()));
    }

    fn status(&self) -> CacheStatus {
        CacheStatus::Ok
    }
}

// ============ Disabled ============

pub struct NoCache;

#[async_trait]
impl CacheLayer for NoCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn put(&self, _key: &str, _value: &str) {}

    fn status(&self) -> CacheStatus {
        CacheStatus::Disabled
    }
}
