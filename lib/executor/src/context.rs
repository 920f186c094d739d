use std::time::Duration;

use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::CacheStats,
    execution::trace::TraceOptions,
    resolve::ErrorBehavior,
    response::value::{Document, DocumentError, NodeId},
};

#[derive(Debug, Clone)]
pub struct CachingOptions {
    pub l1_enabled: bool,
    pub l2_enabled: bool,
    /// TTL used when a fetch's cache configuration does not set one.
    pub default_ttl: Duration,
}

impl Default for CachingOptions {
    fn default() -> Self {
        Self {
            l1_enabled: true,
            l2_enabled: true,
            default_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub caching: CachingOptions,
    pub trace: TraceOptions,
    pub error_behavior: ErrorBehavior,
    pub omit_error_locations: bool,
}

/// Request variables, parsed once per request.
#[derive(Debug, Default)]
pub struct Variables {
    doc: Document,
    root: Option<NodeId>,
}

impl Variables {
    pub fn parse(bytes: &[u8]) -> Result<Self, DocumentError> {
        let mut doc = Document::new();
        let root = doc.parse(bytes)?;
        Ok(Self {
            doc,
            root: Some(root),
        })
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<NodeId> {
        self.doc.get_path(self.root?, path)
    }
}

/// Everything a single execution reads from the request.
#[derive(Debug, Default)]
pub struct Context {
    variables: Variables,
    headers: HeaderMap,
    extensions: Option<Vec<u8>>,
    pub options: ExecutionOptions,
    pub cancellation: CancellationToken,
    pub stats: CacheStats,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw JSON of the request extensions, forwarded to data sources as `body.extensions`.
    pub fn extensions(&self) -> Option<&[u8]> {
        self.extensions.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct ContextBuilder {
    context: Context,
}

impl ContextBuilder {
    pub fn variables(mut self, bytes: &[u8]) -> Result<Self, DocumentError> {
        self.context.variables = Variables::parse(bytes)?;
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.context.headers = headers;
        self
    }

    pub fn extensions(mut self, extensions: Vec<u8>) -> Self {
        self.context.extensions = Some(extensions);
        self
    }

    pub fn options(mut self, options: ExecutionOptions) -> Self {
        self.context.options = options;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.context.cancellation = token;
        self
    }

    pub fn build(self) -> Context {
        self.context
    }
}
