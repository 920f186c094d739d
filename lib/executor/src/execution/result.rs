use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    cache::{CacheEntry, CacheKey, LoaderCache},
    execution::trace::DataSourceLoadTrace,
    executors::error::DataSourceError,
    response::value::{Document, NodeId},
};

/// Entries of the batch input an item receives results from, one per item template.
/// `None` marks a template whose rendering was skipped.
pub type BatchStats = Vec<Option<usize>>;

#[derive(Debug)]
pub enum LoadOutcome {
    /// Nothing to load: no items, everything already present or cached, or every
    /// rendered item was skipped.
    Skipped,
    InvalidInput,
    Failed(DataSourceError),
    Loaded(Bytes),
}

#[derive(Debug, Clone, Copy)]
pub enum CacheHitSource {
    /// Node of the response document merged by an earlier fetch.
    L1(NodeId),
    /// Node of [`FetchResult::cache_doc`], already wrapped at the entity merge path.
    L2(NodeId),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheHit {
    pub item: NodeId,
    pub source: CacheHitSource,
}

/// L2 cache a fetch writes its fresh results to.
#[derive(Clone)]
pub struct CacheTarget {
    pub cache: Arc<dyn LoaderCache>,
    pub keys: Vec<CacheKey>,
    pub ttl: Duration,
}

impl std::fmt::Debug for CacheTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTarget")
            .field("keys", &self.keys)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Owned outcome of the load phase of one fetch, merged into the document afterwards.
#[derive(Debug)]
pub struct FetchResult {
    pub outcome: LoadOutcome,
    /// Items the fetch applies to, tainted ones already removed.
    pub items: Vec<NodeId>,
    /// Items sent to the data source.
    pub fetched: Vec<NodeId>,
    /// Present for batch fetches, aligned with `fetched`.
    pub batch_stats: Option<Vec<BatchStats>>,
    /// Number of entries in the batch input.
    pub batch_size: usize,
    pub hits: Vec<CacheHit>,
    /// Parsed L2 payloads.
    pub cache_doc: Document,
    /// Entity keys of every item, used to populate L1.
    pub l1_keys: Vec<CacheKey>,
    pub l2: Option<CacheTarget>,
    pub trace: Option<DataSourceLoadTrace>,
}

impl FetchResult {
    pub fn new(items: Vec<NodeId>) -> Self {
        Self {
            outcome: LoadOutcome::Skipped,
            items,
            fetched: Vec::new(),
            batch_stats: None,
            batch_size: 0,
            hits: Vec::new(),
            cache_doc: Document::new(),
            l1_keys: Vec::new(),
            l2: None,
            trace: None,
        }
    }

    pub fn skip(&mut self) {
        self.outcome = LoadOutcome::Skipped;
        if let Some(trace) = self.trace.as_mut() {
            trace.load_skipped = true;
        }
    }
}

/// L2 write scheduled after a merge.
pub struct CacheWrite {
    pub cache: Arc<dyn LoaderCache>,
    pub entries: Vec<CacheEntry>,
    pub ttl: Duration,
}
