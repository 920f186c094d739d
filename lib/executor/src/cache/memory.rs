use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use moka::{future::Cache, Expiry};

use crate::cache::{CacheEntry, LoaderCache, LoaderCacheError};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Bytes,
    ttl: Option<Duration>,
    stored_at: Instant,
}

struct EntryExpiry;

impl Expiry<String, StoredEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// L2 cache kept in process memory, bounded by entry count.
#[derive(Clone)]
pub struct InMemoryLoaderCache {
    entries: Cache<String, StoredEntry>,
}

impl InMemoryLoaderCache {
    pub fn new(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();
        Self { entries }
    }
}

#[async_trait]
impl LoaderCache for InMemoryLoaderCache {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<CacheEntry>>, LoaderCacheError> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = self.entries.get(key).await.map(|stored| CacheEntry {
                key: key.clone(),
                remaining_ttl: stored
                    .ttl
                    .map(|ttl| ttl.saturating_sub(stored.stored_at.elapsed())),
                value: stored.value,
            });
            found.push(entry);
        }
        Ok(found)
    }

    async fn set(&self, entries: Vec<CacheEntry>, ttl: Duration) -> Result<(), LoaderCacheError> {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        for entry in entries {
            let stored = StoredEntry {
                value: entry.value,
                ttl,
                stored_at: Instant::now(),
            };
            self.entries.insert(entry.key, stored).await;
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), LoaderCacheError> {
        for key in keys {
            self.entries.invalidate(key).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_deletes_entries() {
        let cache = InMemoryLoaderCache::new(100);
        cache
            .set(
                vec![CacheEntry::new("a", "1"), CacheEntry::new("b", "2")],
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        let keys = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        let found = cache.get(&keys).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].as_ref().unwrap().value, Bytes::from("1"));
        assert!(found[1].is_none());
        assert!(found[0].as_ref().unwrap().remaining_ttl.unwrap() <= Duration::from_secs(30));

        cache.delete(&["a".to_string()]).await.unwrap();
        let found = cache.get(&keys).await.unwrap();
        assert!(found[0].is_none());
        assert_eq!(found[2].as_ref().unwrap().value, Bytes::from("2"));
    }

    #[tokio::test]
    async fn zero_ttl_never_expires() {
        let cache = InMemoryLoaderCache::new(10);
        cache
            .set(vec![CacheEntry::new("k", "v")], Duration::ZERO)
            .await
            .unwrap();
        let found = cache.get(&["k".to_string()]).await.unwrap();
        assert_eq!(found[0].as_ref().unwrap().remaining_ttl, None);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = InMemoryLoaderCache::new(10);
        cache
            .set(vec![CacheEntry::new("k", "v")], Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let found = cache.get(&["k".to_string()]).await.unwrap();
        assert!(found[0].is_none());
    }

    #[tokio::test]
    async fn overwriting_an_entry_applies_the_new_ttl() {
        let cache = InMemoryLoaderCache::new(10);
        cache
            .set(vec![CacheEntry::new("k", "v1")], Duration::from_millis(20))
            .await
            .unwrap();
        cache
            .set(vec![CacheEntry::new("k", "v2")], Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let found = cache.get(&["k".to_string()]).await.unwrap();
        assert_eq!(found[0].as_ref().unwrap().value, Bytes::from("v2"));

        cache
            .set(vec![CacheEntry::new("short", "v1")], Duration::from_secs(30))
            .await
            .unwrap();
        cache
            .set(vec![CacheEntry::new("short", "v2")], Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let found = cache.get(&["short".to_string()]).await.unwrap();
        assert!(found[0].is_none());
    }
}
