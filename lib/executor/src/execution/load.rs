use std::time::Instant;

use ahash::{HashMap, HashSet};
use bumpalo::Bump;
use http::HeaderMap;
use tracing::{debug, instrument, trace, warn};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::{
    arena::ArenaPool,
    cache::{
        key::load_cached_value,
        CacheKey, L1Cache, LoaderCaches,
    },
    context::Context,
    execution::{
        error::ExecutionError,
        result::{BatchStats, CacheHit, CacheHitSource, CacheTarget, FetchResult, LoadOutcome},
        trace::{redact_headers, trace_value, DataSourceLoadTrace},
    },
    executors::map::DataSourceMap,
    fetch::{
        input_template::{set_undefined_variables, RenderError, TemplateData},
        items::{select_items, write_items},
        BatchEntityFetch, EntityInput, Fetch, FetchItem,
    },
    resolve::shape::Object,
    response::value::{Document, NodeId, Value},
    skip_fetch::{can_skip_fetch, satisfies},
    tainted::TaintedObjects,
    utils::consts::{EMPTY_OBJECT, NULL},
};

/// Shared, read-only dependencies of the load phase.
pub struct LoadEnv<'exec> {
    pub ctx: &'exec Context,
    pub data_sources: &'exec DataSourceMap,
    pub caches: &'exec LoaderCaches,
    pub arena_pool: &'exec ArenaPool,
}

/// Execution state a load reads from. Loads never write to it; their results are merged
/// once they complete.
#[derive(Clone, Copy)]
pub struct LoadView<'a> {
    pub doc: &'a Document,
    pub root: NodeId,
    pub tainted: &'a TaintedObjects,
    pub l1: &'a L1Cache,
}

impl LoadEnv<'_> {
    /// Selects the items of a fetch, consults skip-fetch and the caches, renders the
    /// input and calls the data source.
    ///
    /// Only cancellation fails the load. Data source failures and invalid inputs are
    /// reported through the result.
    #[instrument(level = "trace", skip_all, fields(
        data_source = %item.fetch.configuration().data_source,
        path = %item.response_path,
    ))]
    pub async fn load(
        &self,
        view: LoadView<'_>,
        item: &FetchItem,
    ) -> Result<FetchResult, ExecutionError> {
        let fetch = &item.fetch;
        let mut items = select_items(view.doc, view.root, &item.fetch_path);
        if fetch.is_entity() && !view.tainted.is_empty() {
            items = view.tainted.filter_items(view.doc, &items);
        }

        let mut result = FetchResult::new(items);
        let trace_options = &self.ctx.options.trace;
        if trace_options.enabled {
            let mut load_trace = DataSourceLoadTrace::default();
            if !trace_options.exclude_raw_input_data {
                let mut raw = Vec::with_capacity(128);
                write_items(view.doc, &result.items, &mut raw);
                load_trace.raw_input_data = Some(trace_value(&raw));
            }
            result.trace = Some(load_trace);
        }

        if result.items.is_empty() {
            trace!("no items to load for");
            result.skip();
            return Ok(result);
        }

        if can_skip_fetch(fetch.info(), view.doc, &result.items).can_skip {
            debug!("items already hold the provided data, skipping fetch");
            result.skip();
            return Ok(result);
        }

        self.lookup_cache(view, item, &mut result).await;
        let hit_items: HashSet<NodeId> = result.hits.iter().map(|hit| hit.item).collect();
        result.fetched = result
            .items
            .iter()
            .copied()
            .filter(|item| !hit_items.contains(item))
            .collect();
        if result.fetched.is_empty() {
            debug!(hits = result.hits.len(), "every item was served from cache");
            result.skip();
            return Ok(result);
        }

        let Some(input) = self.render_input(view.doc, fetch, &mut result) else {
            return Ok(result);
        };
        self.load_source(item, input, &mut result).await?;
        Ok(result)
    }

    async fn lookup_cache(&self, view: LoadView<'_>, item: &FetchItem, result: &mut FetchResult) {
        let configuration = item.fetch.configuration();
        let caching = &configuration.caching;
        let Some(template) = caching
            .cache_key_template
            .as_ref()
            .filter(|_| caching.enabled)
        else {
            return;
        };
        let options = &self.ctx.options.caching;
        let merge_path = template.entity_merge_path(&configuration.post_processing.merge_path);
        let provides = item.fetch.info().and_then(|info| info.provides_data.as_ref());

        if options.l1_enabled && template.produces_entity_keys() {
            result.l1_keys =
                with_merge_path(template.render(self.ctx, view.doc, &result.items, ""), &merge_path);
            if template.is_entity() {
                self.lookup_l1(view, provides, result);
            }
        }

        if !options.l2_enabled {
            return;
        }
        let Some(cache) = self.caches.get(&caching.cache_name) else {
            debug!(cache = %caching.cache_name, "L2 cache is not registered");
            return;
        };

        let prefix = if caching.include_subgraph_header_prefix {
            header_prefix(self.ctx.headers())
        } else {
            String::new()
        };
        let keys = with_merge_path(
            template.render(self.ctx, view.doc, &result.items, &prefix),
            &merge_path,
        );

        let covered: HashSet<NodeId> = result.hits.iter().map(|hit| hit.item).collect();
        let pending: Vec<&CacheKey> = keys
            .iter()
            .filter(|key| !covered.contains(&key.item))
            .collect();
        let lookup: Vec<String> = pending
            .iter()
            .flat_map(|key| key.keys.iter().cloned())
            .collect();

        if !lookup.is_empty() {
            match cache.get(&lookup).await {
                Ok(entries) => {
                    let mut offset = 0;
                    let mut hits = 0;
                    for key in &pending {
                        let slots = entries
                            .get(offset..offset + key.keys.len())
                            .unwrap_or_default();
                        offset += key.keys.len();
                        let cache_doc = &mut result.cache_doc;
                        let node = slots.iter().flatten().find_map(|entry| {
                            let node = load_cached_value(
                                cache_doc,
                                &entry.value,
                                key.entity_merge_path.as_deref(),
                            )
                            .ok()?;
                            provides
                                .map_or(true, |shape| satisfies(cache_doc, node, shape))
                                .then_some(node)
                        });
                        if let Some(node) = node {
                            hits += 1;
                            result.hits.push(CacheHit {
                                item: key.item,
                                source: CacheHitSource::L2(node),
                            });
                        }
                    }
                    debug!(hits, misses = pending.len() - hits, "L2 cache lookup");
                    self.ctx
                        .stats
                        .record_l2(hits as u64, (pending.len() - hits) as u64);
                    if hits > 0 {
                        if let Some(load_trace) = result.trace.as_mut() {
                            load_trace.l2_cache_hit = true;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "L2 cache lookup failed, loading from the data source");
                    self.ctx.stats.record_l2(0, pending.len() as u64);
                }
            }
        }

        result.l2 = Some(CacheTarget {
            cache: cache.clone(),
            keys,
            ttl: caching.ttl.unwrap_or(options.default_ttl),
        });
    }

    fn lookup_l1(
        &self,
        view: LoadView<'_>,
        provides: Option<&Object>,
        result: &mut FetchResult,
    ) {
        let mut hits = 0;
        for key in &result.l1_keys {
            let node = key
                .keys
                .iter()
                .find_map(|name| view.l1.get(name))
                .filter(|node| provides.map_or(true, |shape| satisfies(view.doc, *node, shape)));
            if let Some(node) = node {
                hits += 1;
                result.hits.push(CacheHit {
                    item: key.item,
                    source: CacheHitSource::L1(node),
                });
            }
        }
        let misses = result.l1_keys.len() - hits;
        debug!(hits, misses, "L1 cache lookup");
        self.ctx.stats.record_l1(hits as u64, misses as u64);
        if hits > 0 {
            if let Some(load_trace) = result.trace.as_mut() {
                load_trace.l1_cache_hit = true;
            }
        }
    }

    /// Renders the data source input. Returns `None` when there is nothing to send, with
    /// the outcome set on the result.
    fn render_input(
        &self,
        doc: &Document,
        fetch: &Fetch,
        result: &mut FetchResult,
    ) -> Option<Vec<u8>> {
        match fetch {
            Fetch::Single(single) => {
                let rendered = with_items_data(doc, &result.fetched, |data| {
                    single.input_template.render_input(self.ctx, Some(data))
                });
                match rendered {
                    Ok(input) => Some(input),
                    Err(err) => {
                        debug!(error = %err, "invalid fetch input");
                        result.outcome = LoadOutcome::InvalidInput;
                        None
                    }
                }
            }
            Fetch::Entity(entity) => self.render_entity_input(doc, &entity.input, result),
            Fetch::BatchEntity(batch) => self.render_batch_input(doc, batch, result),
        }
    }

    fn render_entity_input(
        &self,
        doc: &Document,
        input: &EntityInput,
        result: &mut FetchResult,
    ) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(256);
        let mut rendered_item = Vec::with_capacity(128);
        let mut undefined = Vec::new();

        if let Err(err) = input.header.render(self.ctx, None, &mut out, &mut undefined) {
            debug!(error = %err, "invalid entity fetch header");
            result.outcome = LoadOutcome::InvalidInput;
            return None;
        }
        let item = with_items_data(doc, &result.fetched, |data| {
            input
                .item
                .render(self.ctx, Some(data), &mut rendered_item, &mut undefined)
        });
        if let Err(err) = item {
            if input.skip_err_item {
                debug!(error = %err, "entity item failed to render, skipping fetch");
                result.skip();
            } else {
                result.outcome = LoadOutcome::InvalidInput;
            }
            return None;
        }
        if rendered_item == NULL || rendered_item == EMPTY_OBJECT {
            trace!("entity item rendered empty, skipping fetch");
            result.skip();
            return None;
        }
        out.extend_from_slice(&rendered_item);
        if let Err(err) = input.footer.render(self.ctx, None, &mut out, &mut undefined) {
            debug!(error = %err, "invalid entity fetch footer");
            result.outcome = LoadOutcome::InvalidInput;
            return None;
        }
        Some(set_undefined_variables(out, &undefined))
    }

    fn render_batch_input(
        &self,
        doc: &Document,
        fetch: &BatchEntityFetch,
        result: &mut FetchResult,
    ) -> Option<Vec<u8>> {
        let input = &fetch.input;
        let mut out = Vec::with_capacity(512);
        let mut undefined = Vec::new();

        let usage_id = xxh3_64(fetch.configuration.data_source.as_bytes());
        let arena = self.arena_pool.acquire(usage_id);
        let written = input
            .header
            .render(self.ctx, None, &mut out, &mut undefined)
            .and_then(|_| {
                self.write_batch_items(doc, fetch, &result.fetched, &arena.arena, &mut out, &mut undefined)
            });
        self.arena_pool.release(usage_id, arena);

        match written {
            Err(err) => {
                debug!(error = %err, "invalid batch input");
                result.outcome = LoadOutcome::InvalidInput;
                None
            }
            Ok((_, 0)) => {
                debug!("every batch item was skipped");
                result.skip();
                None
            }
            Ok((stats, batch_size)) => {
                result.batch_stats = Some(stats);
                result.batch_size = batch_size;
                if let Err(err) = input.footer.render(self.ctx, None, &mut out, &mut undefined) {
                    debug!(error = %err, "invalid batch footer");
                    result.outcome = LoadOutcome::InvalidInput;
                    return None;
                }
                Some(set_undefined_variables(out, &undefined))
            }
        }
    }

    /// Writes the deduplicated batch entries. Returns the stats of every item and the
    /// number of entries written.
    fn write_batch_items(
        &self,
        doc: &Document,
        fetch: &BatchEntityFetch,
        fetched: &[NodeId],
        arena: &Bump,
        out: &mut Vec<u8>,
        undefined: &mut Vec<String>,
    ) -> Result<(Vec<BatchStats>, usize), RenderError> {
        let input = &fetch.input;
        let mut written: Vec<&[u8]> = Vec::new();
        let mut by_hash: HashMap<u64, Vec<usize>> = HashMap::default();
        let mut stats = Vec::with_capacity(fetched.len());
        let mut rendered = Vec::with_capacity(128);

        for &item in fetched {
            let mut item_stats = Vec::with_capacity(input.items.len());
            for template in &input.items {
                rendered.clear();
                let data = TemplateData {
                    doc,
                    node: Some(item),
                };
                if let Err(err) = template.render(self.ctx, Some(data), &mut rendered, undefined) {
                    if !input.skip_err_items {
                        return Err(err);
                    }
                    trace!(error = %err, "skipping batch item");
                    item_stats.push(None);
                    continue;
                }
                if (input.skip_null_items && rendered == NULL)
                    || (input.skip_empty_object_items && rendered == EMPTY_OBJECT)
                {
                    item_stats.push(None);
                    continue;
                }

                let same_hash = by_hash.entry(xxh3_64(&rendered)).or_default();
                if let Some(&index) = same_hash
                    .iter()
                    .find(|index| written[**index] == rendered.as_slice())
                {
                    item_stats.push(Some(index));
                    continue;
                }
                if !written.is_empty() {
                    input.separator.render(self.ctx, None, out, undefined)?;
                }
                out.extend_from_slice(&rendered);
                same_hash.push(written.len());
                item_stats.push(Some(written.len()));
                written.push(arena.alloc_slice_copy(&rendered));
            }
            stats.push(item_stats);
        }
        Ok((stats, written.len()))
    }

    async fn load_source(
        &self,
        item: &FetchItem,
        input: Vec<u8>,
        result: &mut FetchResult,
    ) -> Result<(), ExecutionError> {
        let input = match self.ctx.extensions() {
            Some(extensions) => set_input_extensions(input, extensions),
            None => input,
        };
        let trace_options = &self.ctx.options.trace;
        if let Some(load_trace) = result.trace.as_mut() {
            if !trace_options.exclude_input {
                let traced = if trace_options.redact_headers {
                    redact_headers(&input)
                } else {
                    input.clone()
                };
                load_trace.input = Some(trace_value(&traced));
            }
        }

        let data_source = &item.fetch.configuration().data_source;
        let started = Instant::now();
        let loaded = tokio::select! {
            biased;
            _ = self.ctx.cancellation.cancelled() => return Err(ExecutionError::Cancelled),
            loaded = self.data_sources.load(data_source, self.ctx, &input) => loaded,
        };

        if let Some(load_trace) = result.trace.as_mut() {
            load_trace.set_duration(started.elapsed());
            match &loaded {
                Ok(output) if !trace_options.exclude_output && !output.is_empty() => {
                    load_trace.output = Some(trace_value(output));
                }
                Err(err) => load_trace.load_error = Some(err.to_string()),
                Ok(_) => {}
            }
        }

        result.outcome = match loaded {
            Ok(output) => LoadOutcome::Loaded(output),
            Err(err) => LoadOutcome::Failed(err),
        };
        Ok(())
    }
}

fn with_merge_path(mut keys: Vec<CacheKey>, merge_path: &Option<Vec<String>>) -> Vec<CacheKey> {
    if merge_path.is_some() {
        for key in &mut keys {
            key.entity_merge_path.clone_from(merge_path);
        }
    }
    keys
}

/// Runs `f` with the items as template data: a single item as itself, several as an
/// array.
fn with_items_data<R>(
    doc: &Document,
    items: &[NodeId],
    f: impl FnOnce(TemplateData<'_>) -> R,
) -> R {
    if let [item] = items {
        return f(TemplateData {
            doc,
            node: Some(*item),
        });
    }
    let mut scratch = Document::new();
    let values = items.iter().map(|item| scratch.import(doc, *item)).collect();
    let list = scratch.push(Value::Array(values));
    f(TemplateData {
        doc: &scratch,
        node: Some(list),
    })
}

/// Hash of the request headers, isolating L2 entries of callers with different
/// credentials.
pub fn header_prefix(headers: &HeaderMap) -> String {
    let mut pairs: Vec<(&str, &[u8])> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes()))
        .collect();
    pairs.sort_unstable();
    let mut hasher = Xxh3::new();
    for (name, value) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value);
        hasher.update(b"\n");
    }
    hasher.digest().to_string()
}

/// Sets `body.extensions` of a JSON object input.
pub fn set_input_extensions(input: Vec<u8>, extensions: &[u8]) -> Vec<u8> {
    let mut doc = Document::new();
    let Ok(root) = doc.parse(&input) else {
        return input;
    };
    if doc.as_object(root).is_none() {
        return input;
    }
    let Ok(extensions) = doc.parse(extensions) else {
        return input;
    };
    let body = match doc.field(root, "body") {
        Some(body) if doc.as_object(body).is_some() => body,
        _ => {
            let body = doc.push_object();
            doc.set_field(root, "body", body);
            body
        }
    };
    doc.set_field(body, "extensions", extensions);
    doc.to_bytes(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn sets_extensions_on_the_body() {
        let input = set_input_extensions(
            br#"{"method":"POST","body":{"query":"{me}"}}"#.to_vec(),
            br#"{"trace":true}"#,
        );
        insta::assert_snapshot!(String::from_utf8(input).unwrap(), @r#"{"method":"POST","body":{"query":"{me}","extensions":{"trace":true}}}"#);

        let input = set_input_extensions(br#"{"method":"POST"}"#.to_vec(), br#"{"a":1}"#);
        insta::assert_snapshot!(String::from_utf8(input).unwrap(), @r#"{"method":"POST","body":{"extensions":{"a":1}}}"#);
    }

    #[test]
    fn header_prefix_ignores_header_order() {
        let mut first = HeaderMap::new();
        first.insert("authorization", HeaderValue::from_static("Bearer a"));
        first.insert("x-tenant", HeaderValue::from_static("acme"));
        let mut second = HeaderMap::new();
        second.insert("x-tenant", HeaderValue::from_static("acme"));
        second.insert("authorization", HeaderValue::from_static("Bearer a"));
        assert_eq!(header_prefix(&first), header_prefix(&second));

        second.insert("authorization", HeaderValue::from_static("Bearer b"));
        assert_ne!(header_prefix(&first), header_prefix(&second));
    }
}
