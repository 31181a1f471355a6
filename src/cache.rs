//! In-memory response cache for query operations.
//!
//! Document-granularity cache keyed by operation name, query text, and
//! serialized variables. Only clean (error-free) query responses are stored;
//! mutations and subscriptions never touch the cache.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// How a query interacts with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPolicy {
    /// Serve from cache when possible, fetch and store otherwise.
    #[default]
    CacheFirst,
    /// Always fetch; store the result.
    NetworkOnly,
    /// Always fetch; never store.
    NoStore,
}

/// Cache key for one operation + variables combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Derive the key for an operation invocation.
    #[must_use]
    pub fn for_operation(
        operation_name: &str,
        query: &str,
        variables: &serde_json::Value,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        operation_name.hash(&mut hasher);
        query.hash(&mut hasher);
        variables.to_string().hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// In-memory response cache.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, serde_json::Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached response body.
    pub async fn get(&self, key: CacheKey) -> Option<serde_json::Value> {
        let entries = self.entries.lock().await;
        let value = entries.get(&key).cloned();
        drop(entries);

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Store a response body.
    pub async fn store(&self, key: CacheKey, data: serde_json::Value) {
        self.entries.lock().await.insert(key, data);
    }

    /// Drop one entry.
    pub async fn invalidate(&self, key: CacheKey) {
        self.entries.lock().await.remove(&key);
    }

    /// Drop all entries.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of cache misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
