use ahash::{HashMap, HashSet};
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    cache::{
        key::{cache_keys_to_entries, cached_node},
        CacheKey, L1Cache,
    },
    execution::{
        error::ExecutionError,
        load::{LoadEnv, LoadView},
        result::{CacheHitSource, CacheWrite, FetchResult, LoadOutcome},
        trace::DataSourceLoadTrace,
    },
    fetch::{
        input_template::{InputTemplate, TemplateData},
        FetchItem, FetchTreeNode, OperationType,
    },
    response::{
        error_normalization::{add_subgraph_info_to_error, rewrite_entities_path},
        graphql_error::{GraphQLError, GraphQLErrorPathSegment},
        merge::{deep_merge, merge_with_path, MergeError},
        value::{Document, NodeId, Value},
    },
    tainted::{tainted_indices, TaintedObjects},
    utils::consts::ENTITIES_FIELD_NAME,
};

struct ConcurrencyScope<'a, T> {
    jobs: FuturesUnordered<BoxFuture<'a, Result<T, ExecutionError>>>,
}

impl<'a, T> ConcurrencyScope<'a, T> {
    fn new() -> Self {
        Self {
            jobs: FuturesUnordered::new(),
        }
    }

    fn spawn(&mut self, future: BoxFuture<'a, Result<T, ExecutionError>>) {
        self.jobs.push(future);
    }

    /// Polls every job to completion. The first error or a cancellation stops the scope;
    /// pending jobs are dropped and the results collected so far are returned with it.
    async fn join_all(mut self, cancellation: &CancellationToken) -> (Vec<T>, Option<ExecutionError>) {
        let mut results = Vec::with_capacity(self.jobs.len());
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return (results, Some(ExecutionError::Cancelled)),
                next = self.jobs.next() => match next {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(err)) => return (results, Some(err)),
                    None => return (results, None),
                },
            }
        }
    }
}

/// Everything a finished walk produced.
pub struct LoaderOutput {
    pub doc: Document,
    pub data: NodeId,
    pub errors: Vec<GraphQLError>,
    pub traces: HashMap<usize, DataSourceLoadTrace>,
}

/// Walks a fetch tree and owns the response document while doing so.
///
/// Loads only read the document. Their owned results are merged here one at a time, so
/// concurrent fetches never touch the document themselves.
pub struct Loader<'exec> {
    env: LoadEnv<'exec>,
    operation_type: OperationType,
    doc: Document,
    data: NodeId,
    errors: Vec<GraphQLError>,
    tainted: TaintedObjects,
    l1: L1Cache,
    traces: HashMap<usize, DataSourceLoadTrace>,
}

impl<'exec> Loader<'exec> {
    pub fn new(env: LoadEnv<'exec>, operation_type: OperationType) -> Self {
        let mut doc = Document::with_capacity(256);
        let data = doc.push_object();
        Self {
            env,
            operation_type,
            doc,
            data,
            errors: Vec::new(),
            tainted: TaintedObjects::default(),
            l1: L1Cache::new(),
            traces: HashMap::default(),
        }
    }

    pub async fn run(mut self, tree: &'exec FetchTreeNode) -> Result<LoaderOutput, ExecutionError> {
        self.walk(tree, 0).await?;
        Ok(LoaderOutput {
            doc: self.doc,
            data: self.data,
            errors: self.errors,
            traces: self.traces,
        })
    }

    fn view(&self) -> LoadView<'_> {
        LoadView {
            doc: &self.doc,
            root: self.data,
            tainted: &self.tainted,
            l1: &self.l1,
        }
    }

    /// `fetch_id` is the pre-order id of the first fetch in `node`.
    fn walk<'s>(
        &'s mut self,
        node: &'exec FetchTreeNode,
        fetch_id: usize,
    ) -> BoxFuture<'s, Result<(), ExecutionError>> {
        Box::pin(async move {
            match node {
                FetchTreeNode::Single(item) => self.run_single(item, fetch_id).await,
                FetchTreeNode::Sequence { children } => self.run_sequence(children, fetch_id).await,
                FetchTreeNode::Parallel { children } => self.run_parallel(children, fetch_id).await,
            }
        })
    }

    #[instrument(level = "trace", skip_all, fields(fetch_id = fetch_id, path = %item.response_path))]
    async fn run_single(&mut self, item: &'exec FetchItem, fetch_id: usize) -> Result<(), ExecutionError> {
        let result = self.env.load(self.view(), item).await?;
        let write = self.merge(item, fetch_id, result)?;
        self.store(write).await;
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(children = children.len()))]
    async fn run_sequence(
        &mut self,
        children: &'exec [FetchTreeNode],
        fetch_id: usize,
    ) -> Result<(), ExecutionError> {
        let mut next_id = fetch_id;
        for child in children {
            self.walk(child, next_id).await?;
            next_id += child.fetch_count();
        }
        Ok(())
    }

    /// Loads the single fetches among `children` concurrently and merges them in child
    /// order, then walks the nested groups.
    #[instrument(level = "trace", skip_all, fields(children = children.len()))]
    async fn run_parallel(
        &mut self,
        children: &'exec [FetchTreeNode],
        fetch_id: usize,
    ) -> Result<(), ExecutionError> {
        let mut ids = Vec::with_capacity(children.len());
        let mut next_id = fetch_id;
        for child in children {
            ids.push(next_id);
            next_id += child.fetch_count();
        }

        let (mut results, failure) = {
            let view = self.view();
            let env = &self.env;
            let mut scope = ConcurrencyScope::new();
            for (position, child) in children.iter().enumerate() {
                if let FetchTreeNode::Single(item) = child {
                    scope.spawn(Box::pin(async move {
                        env.load(view, item).await.map(|result| (position, result))
                    }));
                }
            }
            scope.join_all(&env.ctx.cancellation).await
        };

        results.sort_unstable_by_key(|(position, _)| *position);
        let mut writes = Vec::new();
        for (position, result) in results {
            if let FetchTreeNode::Single(item) = &children[position] {
                writes.extend(self.merge(item, ids[position], result)?);
            }
        }
        for write in writes {
            self.store(Some(write)).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        for (position, child) in children.iter().enumerate() {
            if !matches!(child, FetchTreeNode::Single(_)) {
                self.walk(child, ids[position]).await?;
            }
        }
        Ok(())
    }

    /// Applies a load result to the document. Returns the L2 write to perform, if any.
    fn merge(
        &mut self,
        item: &FetchItem,
        fetch_id: usize,
        mut result: FetchResult,
    ) -> Result<Option<CacheWrite>, ExecutionError> {
        if let Some(load_trace) = result.trace.take() {
            self.traces.insert(fetch_id, load_trace);
        }
        self.merge_cache_hits(item, &result)?;

        let output = match std::mem::replace(&mut result.outcome, LoadOutcome::Skipped) {
            LoadOutcome::Skipped => {
                self.populate_l1(&result.l1_keys);
                return Ok(None);
            }
            LoadOutcome::InvalidInput => {
                self.errors.push(invalid_input_error(item));
                return Ok(None);
            }
            LoadOutcome::Failed(err) => {
                warn!(
                    error = %err,
                    data_source = %item.fetch.configuration().data_source,
                    path = %item.response_path,
                    "data source load failed"
                );
                let error = self.failed_to_fetch(item, None);
                self.errors.push(error);
                return Ok(None);
            }
            LoadOutcome::Loaded(output) => output,
        };
        if output.is_empty() {
            return Ok(None);
        }

        let response = match self.doc.parse(&output) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, path = %item.response_path, "invalid data source response");
                let error = self.failed_to_fetch(item, None);
                self.errors.push(error);
                return Ok(None);
            }
        };

        let post_processing = &item.fetch.configuration().post_processing;
        let data = match &post_processing.select_response_data_path {
            Some(path) => self.doc.get_path(response, path),
            None => Some(response),
        };
        if let Some(path) = &post_processing.select_response_errors_path {
            if let Some(errors) = self.doc.get_path(response, path) {
                self.collect_errors(item, &result, data, errors);
            }
        }

        let Some(data) = data.filter(|data| !self.doc.is_null(*data)) else {
            return Ok(None);
        };
        if !self.merge_data(item, &result, data)? {
            return Ok(None);
        }
        self.populate_l1(&result.l1_keys);
        Ok(self.cache_write(result))
    }

    fn merge_cache_hits(&mut self, item: &FetchItem, result: &FetchResult) -> Result<(), ExecutionError> {
        for hit in &result.hits {
            let source = match hit.source {
                CacheHitSource::L1(node) => self.doc.duplicate(node),
                CacheHitSource::L2(node) => self.doc.import(&result.cache_doc, node),
            };
            deep_merge(&mut self.doc, hit.item, source).map_err(|source| merge_error(item, source))?;
        }
        if !result.hits.is_empty() {
            trace!(hits = result.hits.len(), "merged cached items");
        }
        Ok(())
    }

    fn collect_errors(
        &mut self,
        item: &FetchItem,
        result: &FetchResult,
        data: Option<NodeId>,
        errors: NodeId,
    ) {
        let Some(list) = self.doc.as_array(errors).map(<[_]>::to_vec) else {
            return;
        };

        if item.fetch.is_entity() {
            let entities = data.and_then(|data| {
                self.doc
                    .field(data, ENTITIES_FIELD_NAME)
                    .or_else(|| self.doc.as_array(data).map(|_| data))
            });
            if let Some(entities) = entities {
                let tainted: Vec<NodeId> = tainted_indices(item.fetch.info(), &self.doc, entities, errors)
                    .into_iter()
                    .flat_map(|index| entity_items(result, index))
                    .collect();
                if !tainted.is_empty() {
                    debug!(count = tainted.len(), "marking entities as tainted");
                }
                for node in tainted {
                    self.tainted.insert(node);
                }
            }
        }

        let elements = item.response_path_elements();
        let subgraph = item.fetch.subgraph_name();
        let omit_locations = self.env.ctx.options.omit_error_locations;
        for error in list {
            let Some(mut error) = GraphQLError::from_document(&self.doc, error, omit_locations) else {
                continue;
            };
            rewrite_entities_path(&mut error, &elements);
            if let Some(subgraph) = subgraph {
                error = add_subgraph_info_to_error(error, subgraph);
            }
            self.errors.push(error);
        }
    }

    /// Merges the selected data into the fetched items. Returns false when the data did
    /// not line up with the items and an error was reported instead.
    fn merge_data(
        &mut self,
        item: &FetchItem,
        result: &FetchResult,
        data: NodeId,
    ) -> Result<bool, ExecutionError> {
        let post_processing = &item.fetch.configuration().post_processing;
        let merge_path = &post_processing.merge_path;

        if let Some(stats) = &result.batch_stats {
            let Some(entities) = self.entity_list(item, data, result.batch_size) else {
                return Ok(false);
            };
            let mut used = vec![false; entities.len()];
            for (target, item_stats) in result.fetched.iter().zip(stats) {
                if let Some(template) = &post_processing.response_template {
                    let values = item_stats
                        .iter()
                        .map(|index| match index {
                            Some(index) => entities[*index],
                            None => self.doc.push_null(),
                        })
                        .collect();
                    let list = self.doc.push(Value::Array(values));
                    let Some(source) = self.apply_response_template(item, template, list) else {
                        return Ok(false);
                    };
                    merge_with_path(&mut self.doc, *target, source, merge_path)
                        .map_err(|source| merge_error(item, source))?;
                    continue;
                }
                for index in item_stats.iter().flatten() {
                    let mut source = entities[*index];
                    if used[*index] {
                        source = self.doc.duplicate(source);
                    }
                    used[*index] = true;
                    merge_with_path(&mut self.doc, *target, source, merge_path)
                        .map_err(|source| merge_error(item, source))?;
                }
            }
            return Ok(true);
        }

        let data = match &post_processing.response_template {
            Some(template) if result.fetched.len() <= 1 => {
                match self.apply_response_template(item, template, data) {
                    Some(data) => data,
                    None => return Ok(false),
                }
            }
            _ => data,
        };

        if let [target] = result.fetched.as_slice() {
            merge_with_path(&mut self.doc, *target, data, merge_path)
                .map_err(|source| merge_error(item, source))?;
            return Ok(true);
        }
        let Some(values) = self.entity_list(item, data, result.fetched.len()) else {
            return Ok(false);
        };
        for (target, source) in result.fetched.iter().zip(values) {
            merge_with_path(&mut self.doc, *target, source, merge_path)
                .map_err(|source| merge_error(item, source))?;
        }
        Ok(true)
    }

    /// The elements of `data` when it is an array of `expected` values, otherwise reports
    /// the mismatch.
    fn entity_list(&mut self, item: &FetchItem, data: NodeId, expected: usize) -> Option<Vec<NodeId>> {
        match self.doc.as_array(data) {
            Some(values) if values.len() == expected => Some(values.to_vec()),
            values => {
                let got = values.map_or(0, <[_]>::len);
                warn!(expected, got, path = %item.response_path, "entity count mismatch");
                let reason = format!("expected {expected} entities, got {got}.");
                let error = self.failed_to_fetch(item, Some(&reason));
                self.errors.push(error);
                None
            }
        }
    }

    fn apply_response_template(
        &mut self,
        item: &FetchItem,
        template: &InputTemplate,
        data: NodeId,
    ) -> Option<NodeId> {
        let mut out = Vec::with_capacity(128);
        let mut undefined = Vec::new();
        let rendered = template.render(
            self.env.ctx,
            Some(TemplateData {
                doc: &self.doc,
                node: Some(data),
            }),
            &mut out,
            &mut undefined,
        );
        let parsed = match rendered {
            Ok(()) => self.doc.parse(&out).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match parsed {
            Ok(node) => Some(node),
            Err(err) => {
                warn!(error = %err, path = %item.response_path, "response template failed");
                let error = self.failed_to_fetch(item, None);
                self.errors.push(error);
                None
            }
        }
    }

    fn populate_l1(&self, keys: &[CacheKey]) {
        for key in keys {
            let node = cached_node(&self.doc, key);
            for name in &key.keys {
                self.l1.insert(name.clone(), node);
            }
        }
    }

    /// L2 entries for the items that were loaded from the data source and received data.
    fn cache_write(&self, result: FetchResult) -> Option<CacheWrite> {
        let target = result.l2?;
        let loaded: HashSet<NodeId> = match &result.batch_stats {
            Some(stats) => result
                .fetched
                .iter()
                .zip(stats)
                .filter(|(_, item_stats)| item_stats.iter().any(Option::is_some))
                .map(|(item, _)| *item)
                .collect(),
            None => result.fetched.iter().copied().collect(),
        };
        let keys: Vec<CacheKey> = target
            .keys
            .into_iter()
            .filter(|key| loaded.contains(&key.item))
            .collect();
        let entries = cache_keys_to_entries(&self.doc, &keys);
        (!entries.is_empty()).then_some(CacheWrite {
            cache: target.cache,
            entries,
            ttl: target.ttl,
        })
    }

    async fn store(&self, write: Option<CacheWrite>) {
        let Some(write) = write else {
            return;
        };
        let count = write.entries.len();
        match write.cache.set(write.entries, write.ttl).await {
            Ok(()) => trace!(entries = count, "L2 cache updated"),
            Err(err) => warn!(error = %err, "L2 cache write failed"),
        }
    }

    fn failed_to_fetch(&self, item: &FetchItem, reason: Option<&str>) -> GraphQLError {
        let path = if item.response_path.is_empty() {
            self.operation_type.to_string()
        } else {
            item.response_path.clone()
        };
        let message = match (item.fetch.subgraph_name(), reason) {
            (Some(name), Some(reason)) => {
                format!("Failed to fetch from Subgraph '{name}' at path '{path}': {reason}")
            }
            (Some(name), None) => format!("Failed to fetch from Subgraph '{name}' at path '{path}'."),
            (None, Some(reason)) => format!("Failed to fetch from Subgraph at path '{path}': {reason}"),
            (None, None) => format!("Failed to fetch from Subgraph at path '{path}'."),
        };
        message.into()
    }
}

/// Items that received the entity at `index` of the response.
fn entity_items(result: &FetchResult, index: usize) -> Vec<NodeId> {
    match &result.batch_stats {
        Some(stats) => result
            .fetched
            .iter()
            .zip(stats)
            .filter(|(_, item_stats)| item_stats.contains(&Some(index)))
            .map(|(item, _)| *item)
            .collect(),
        None => result.fetched.get(index).copied().into_iter().collect(),
    }
}

fn merge_error(item: &FetchItem, source: MergeError) -> ExecutionError {
    let subgraph = item
        .fetch
        .subgraph_name()
        .unwrap_or(&item.fetch.configuration().data_source)
        .to_string();
    ExecutionError::Merge { subgraph, source }
}

fn invalid_input_error(item: &FetchItem) -> GraphQLError {
    let path = item
        .response_path_elements()
        .into_iter()
        .enumerate()
        .filter(|(position, element)| {
            *element != "@"
                && !(*position == 0 && matches!(*element, "query" | "mutation" | "subscription"))
        })
        .map(|(_, element)| GraphQLErrorPathSegment::from(element))
        .collect();
    GraphQLError::from("invalid input").with_path(path)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn join_all_collects_every_result() {
        let mut scope = ConcurrencyScope::new();
        for i in 0..3usize {
            scope.spawn(async move { Ok(i) }.boxed());
        }
        let (mut results, failure) = scope.join_all(&CancellationToken::new()).await;
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 2]);
        assert!(failure.is_none());
    }

    #[tokio::test]
    async fn join_all_stops_on_first_error() {
        let mut scope = ConcurrencyScope::new();
        scope.spawn(async { Ok(1) }.boxed());
        scope.spawn(async { Err(ExecutionError::Cancelled) }.boxed());
        scope.spawn(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(3)
            }
            .boxed(),
        );
        let (results, failure) = scope.join_all(&CancellationToken::new()).await;
        assert!(!results.contains(&3));
        assert!(matches!(failure, Some(ExecutionError::Cancelled)));
    }

    #[tokio::test]
    async fn join_all_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let mut scope = ConcurrencyScope::<usize>::new();
        scope.spawn(futures::future::pending().boxed());
        let (results, failure) = scope.join_all(&token).await;
        assert!(results.is_empty());
        assert!(matches!(failure, Some(ExecutionError::Cancelled)));
    }

    #[test]
    fn invalid_input_errors_use_the_response_path() {
        let item: FetchItem = sonic_rs::from_str(
            r#"{"response_path":"query.products.@.reviews","fetch":{"kind":"Single","data_source":"a","input_template":{"segments":[]}}}"#,
        )
        .unwrap();
        let error = invalid_input_error(&item);
        insta::assert_snapshot!(sonic_rs::to_string(&error).unwrap(), @r#"{"message":"invalid input","path":["products","reviews"]}"#);
    }
}
