use std::collections::HashMap;

use bytes::Bytes;

use crate::{
    context::Context,
    executors::{
        common::{DataSource, DataSourceArc},
        error::DataSourceError,
    },
};

/// Data sources by the name fetches refer to them with.
#[derive(Default, Clone)]
pub struct DataSourceMap {
    inner: HashMap<String, DataSourceArc>,
}

impl DataSourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data_source: DataSourceArc) {
        self.inner.insert(name.into(), data_source);
    }

    pub fn with<D>(mut self, name: impl Into<String>, data_source: D) -> Self
    where
        D: DataSource + Send + Sync + 'static,
    {
        self.insert(name, data_source.to_arc());
        self
    }

    pub fn get(&self, name: &str) -> Option<&DataSourceArc> {
        self.inner.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub async fn load(&self, name: &str, ctx: &Context, input: &[u8]) -> Result<Bytes, DataSourceError> {
        match self.inner.get(name) {
            Some(data_source) => data_source.load(ctx, input).await,
            None => Err(DataSourceError::NotFound(name.to_string())),
        }
    }
}
