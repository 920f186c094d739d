use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{context::Context, executors::error::DataSourceError};

/// Backend a fetch loads from. The input is the rendered fetch input and the output the
/// raw response, both opaque to the loader.
#[async_trait]
pub trait DataSource {
    async fn load(&self, ctx: &Context, input: &[u8]) -> Result<Bytes, DataSourceError>;

    fn to_arc(self) -> DataSourceArc
    where
        Self: Sized + Send + Sync + 'static,
    {
        Arc::new(self)
    }
}

pub type DataSourceType = dyn DataSource + Send + Sync;

pub type DataSourceArc = Arc<DataSourceType>;
