use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::key::CacheKeyTemplate;

pub mod key;
pub mod l1;
pub mod memory;

pub use key::CacheKey;
pub use l1::L1Cache;
pub use memory::InMemoryLoaderCache;

#[derive(Debug, thiserror::Error)]
pub enum LoaderCacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Entry of the external cache. The payload is opaque to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    /// Time left before the entry expires, when known.
    pub remaining_ttl: Option<Duration>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            remaining_ttl: None,
        }
    }
}

/// External (L2) key/value cache.
///
/// `get` returns one slot per requested key, in the same order, `None` meaning a miss.
/// A TTL of zero means the entries never expire.
#[async_trait]
pub trait LoaderCache: Send + Sync {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<CacheEntry>>, LoaderCacheError>;
    async fn set(&self, entries: Vec<CacheEntry>, ttl: Duration) -> Result<(), LoaderCacheError>;
    async fn delete(&self, keys: &[String]) -> Result<(), LoaderCacheError>;
}

/// Named L2 caches a fetch can refer to through `cache_name`.
#[derive(Clone, Default)]
pub struct LoaderCaches {
    caches: HashMap<String, Arc<dyn LoaderCache>>,
}

impl fmt::Debug for LoaderCaches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderCaches")
            .field("names", &self.caches.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LoaderCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, cache: Arc<dyn LoaderCache>) {
        self.caches.insert(name.into(), cache);
    }

    pub fn with(mut self, name: impl Into<String>, cache: Arc<dyn LoaderCache>) -> Self {
        self.register(name, cache);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn LoaderCache>> {
        self.caches.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchCacheConfiguration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cache_name: String,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key_template: Option<CacheKeyTemplate>,
    /// Prefixes L2 keys with a hash of the request headers, isolating callers with
    /// different credentials.
    #[serde(default)]
    pub include_subgraph_header_prefix: bool,
}

/// Cache hit/miss counters of one execution.
#[derive(Debug, Default)]
pub struct CacheStats {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
}

impl CacheStats {
    pub fn record_l1(&self, hits: u64, misses: u64) {
        self.l1_hits.fetch_add(hits, Ordering::Relaxed);
        self.l1_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub fn record_l2(&self, hits: u64, misses: u64) {
        self.l2_hits.fetch_add(hits, Ordering::Relaxed);
        self.l2_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
        }
    }
}
