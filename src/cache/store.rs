// =============================================================================
// Key/value store — in-memory for tests, Redis for cross-instance sharing
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CacheConfig;

/// Storage interface behind the price cache and the policy/emergency store.
///
/// Calls are synchronous and short (single GET/SET-class operations); callers
/// on latency-sensitive paths read through their local TTL caches and only
/// touch the store on miss or refresh.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
    /// Append one entry to the list at `key`.
    fn append(&self, key: &str, value: &str);
    /// Most recent `limit` entries of the list at `key`, oldest first.
    fn list(&self, key: &str, limit: usize) -> Vec<String>;
}

/// Build the store selected by the configuration: Redis when an address is
/// configured, otherwise the in-memory store.
pub fn open(cfg: &CacheConfig) -> Result<Arc<dyn KvStore>> {
    if cfg.address.is_empty() {
        info!("cache address empty — using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(&cfg.address, cfg.pool_size as usize)
        .with_context(|| format!("failed to open redis store at {}", cfg.address))?;
    info!(address = %cfg.address, pool_size = cfg.pool_size, "redis store opened");
    Ok(Arc::new(store))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store used by tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn delete(&self, key: &str) {
        self.values.lock().remove(key);
    }

    fn append(&self, key: &str, value: &str) {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }

    fn list(&self, key: &str, limit: usize) -> Vec<String> {
        self.lists
            .lock()
            .get(key)
            .map(|v| {
                let start = v.len().saturating_sub(limit);
                v[start..].to_vec()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Redis store
// ---------------------------------------------------------------------------

/// Redis-backed store with a small free-list connection pool.
pub struct RedisStore {
    client: redis::Client,
    pool: Mutex<Vec<redis::Connection>>,
    pool_size: usize,
}

impl RedisStore {
    pub fn connect(url: &str, pool_size: usize) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            pool: Mutex::new(Vec::new()),
            pool_size: pool_size.max(1),
        })
    }

    /// Run `f` with a pooled connection. Connection failures degrade to
    /// `None`; cache consumers treat that as a miss.
    fn with_conn<T>(&self, f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>) -> Option<T> {
        let mut conn = match self.pool.lock().pop() {
            Some(conn) => conn,
            None => match self.client.get_connection() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "redis connection failed");
                    return None;
                }
            },
        };

        match f(&mut conn) {
            Ok(value) => {
                let mut pool = self.pool.lock();
                if pool.len() < self.pool_size {
                    pool.push(conn);
                }
                Some(value)
            }
            Err(e) => {
                warn!(error = %e, "redis command failed");
                None
            }
        }
    }
}

impl KvStore for RedisStore {
    fn get(&self, key: &str) -> Option<String> {
        self.with_conn(|conn| redis::cmd("GET").arg(key).query::<Option<String>>(conn))
            .flatten()
    }

    fn set(&self, key: &str, value: &str) {
        self.with_conn(|conn| redis::cmd("SET").arg(key).arg(value).query::<()>(conn));
    }

    fn delete(&self, key: &str) {
        self.with_conn(|conn| redis::cmd("DEL").arg(key).query::<()>(conn));
    }

    fn append(&self, key: &str, value: &str) {
        self.with_conn(|conn| redis::cmd("RPUSH").arg(key).arg(value).query::<()>(conn));
    }

    fn list(&self, key: &str, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }
        let start = -(limit as isize);
        self.with_conn(|conn| {
            redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(-1)
                .query::<Vec<String>>(conn)
        })
        .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
