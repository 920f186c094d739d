use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use hive_router_fetch_loader::{
    Context, DataSource, DataSourceError, DataSourceMap, ResponsePlan,
};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::debug;

/// A plan together with the request it runs for and what every data source answers.
#[derive(Debug, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub extensions: Option<serde_json::Value>,
    #[serde(flatten)]
    pub plan: ResponsePlan,
    pub data_sources: HashMap<String, CannedResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CannedResponse {
    /// `{"error": "..."}` makes the data source fail with that message.
    Failure { error: String },
    Body(serde_json::Value),
}

struct CannedDataSource {
    name: String,
    response: Result<Bytes, String>,
}

#[async_trait]
impl DataSource for CannedDataSource {
    async fn load(&self, _ctx: &Context, input: &[u8]) -> Result<Bytes, DataSourceError> {
        debug!(
            data_source = %self.name,
            input = %String::from_utf8_lossy(input),
            "serving canned response"
        );
        self.response
            .clone()
            .map_err(DataSourceError::LoadFailure)
    }
}

impl Fixture {
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn data_source_map(&self) -> anyhow::Result<DataSourceMap> {
        let mut map = DataSourceMap::new();
        for (name, canned) in &self.data_sources {
            let response = match canned {
                CannedResponse::Failure { error } => Err(error.clone()),
                CannedResponse::Body(body) => Ok(Bytes::from(serde_json::to_vec(body)?)),
            };
            map = map.with(
                name.clone(),
                CannedDataSource {
                    name: name.clone(),
                    response,
                },
            );
        }
        Ok(map)
    }

    pub fn header_map(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        Ok(headers)
    }
}
