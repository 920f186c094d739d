//! Data sources and caches for loader tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    cache::{CacheEntry, InMemoryLoaderCache, LoaderCache, LoaderCacheError},
    context::Context,
    executors::{common::DataSource, error::DataSourceError},
};

/// Inputs a data source received, shared with the test.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn record(&self, input: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(input).into_owned());
    }

    pub fn inputs(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Answers every load with the same response.
pub struct StaticDataSource {
    response: Bytes,
    calls: CallLog,
}

impl StaticDataSource {
    pub fn new(response: &str) -> Self {
        Self {
            response: Bytes::from(response.to_string()),
            calls: CallLog::default(),
        }
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn load(&self, _ctx: &Context, input: &[u8]) -> Result<Bytes, DataSourceError> {
        self.calls.record(input);
        Ok(self.response.clone())
    }
}

type Responder = dyn Fn(&str) -> Result<String, DataSourceError> + Send + Sync;

/// Computes the response from the input, optionally after a delay.
pub struct FnDataSource {
    respond: Box<Responder>,
    delay: Option<Duration>,
    calls: CallLog,
}

impl FnDataSource {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Result<String, DataSourceError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            delay: None,
            calls: CallLog::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl DataSource for FnDataSource {
    async fn load(&self, _ctx: &Context, input: &[u8]) -> Result<Bytes, DataSourceError> {
        self.calls.record(input);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(&String::from_utf8_lossy(input)).map(Bytes::from)
    }
}

/// In-memory L2 cache that records the keys it was asked for and written to.
#[derive(Clone)]
pub struct RecordingCache {
    inner: Arc<InMemoryLoaderCache>,
    gets: Arc<Mutex<Vec<Vec<String>>>>,
    sets: Arc<Mutex<Vec<(Vec<String>, Duration)>>>,
    fail_gets: bool,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryLoaderCache::new(1_000)),
            gets: Arc::default(),
            sets: Arc::default(),
            fail_gets: false,
        }
    }

    pub fn failing_gets() -> Self {
        Self {
            fail_gets: true,
            ..Self::new()
        }
    }

    pub fn gets(&self) -> Vec<Vec<String>> {
        self.gets.lock().unwrap().clone()
    }

    pub fn sets(&self) -> Vec<(Vec<String>, Duration)> {
        self.sets.lock().unwrap().clone()
    }

    pub async fn value(&self, key: &str) -> Option<String> {
        let entries = self.inner.get(&[key.to_string()]).await.ok()?;
        entries
            .into_iter()
            .next()
            .flatten()
            .map(|entry| String::from_utf8_lossy(&entry.value).into_owned())
    }
}

#[async_trait]
impl LoaderCache for RecordingCache {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<CacheEntry>>, LoaderCacheError> {
        self.gets.lock().unwrap().push(keys.to_vec());
        if self.fail_gets {
            return Err(LoaderCacheError::Backend("connection refused".to_string()));
        }
        self.inner.get(keys).await
    }

    async fn set(&self, entries: Vec<CacheEntry>, ttl: Duration) -> Result<(), LoaderCacheError> {
        self.sets
            .lock()
            .unwrap()
            .push((entries.iter().map(|entry| entry.key.clone()).collect(), ttl));
        self.inner.set(entries, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), LoaderCacheError> {
        self.inner.delete(keys).await
    }
}
