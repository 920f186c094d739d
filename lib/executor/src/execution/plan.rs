use std::{sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    arena::{ArenaPool, ArenaPoolConfig},
    cache::{CacheStatsSnapshot, LoaderCaches},
    context::Context,
    execution::{
        error::ExecutionError,
        load::LoadEnv,
        loader::{Loader, LoaderOutput},
        trace::FetchTreeTraceNode,
    },
    executors::map::DataSourceMap,
    fetch::{FetchTreeNode, OperationType},
    resolve::{
        resolvable::{resolve, ResolveOptions},
        shape::Object,
    },
    response::{
        graphql_error::GraphQLError,
        value::{Document, NodeId},
    },
};

/// What the planner hands over for one operation: the fetches to run and the shape of
/// the client response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePlan {
    #[serde(default)]
    pub operation_type: OperationType,
    pub fetches: FetchTreeNode,
    pub data: Object,
}

/// Merged document of a finished fetch tree, before resolution.
pub struct LoadedResponse {
    pub document: Document,
    pub data: NodeId,
    pub errors: Vec<GraphQLError>,
    pub trace: Option<FetchTreeTraceNode>,
}

#[derive(Debug)]
pub struct ExecutionOutput {
    pub body: Vec<u8>,
    pub errors: Vec<GraphQLError>,
    pub data_is_null: bool,
    pub trace: Option<FetchTreeTraceNode>,
    pub cache_stats: CacheStatsSnapshot,
}

/// Long-lived part of the loader, shared by every request.
pub struct FetchLoader {
    data_sources: DataSourceMap,
    caches: LoaderCaches,
    arena_pool: Arc<ArenaPool>,
}

impl FetchLoader {
    pub fn new(data_sources: DataSourceMap) -> Self {
        Self {
            data_sources,
            caches: LoaderCaches::default(),
            arena_pool: Arc::new(ArenaPool::new(ArenaPoolConfig::default())),
        }
    }

    pub fn with_caches(mut self, caches: LoaderCaches) -> Self {
        self.caches = caches;
        self
    }

    pub fn with_arena_pool(mut self, arena_pool: Arc<ArenaPool>) -> Self {
        self.arena_pool = arena_pool;
        self
    }

    pub fn arena_pool(&self) -> &Arc<ArenaPool> {
        &self.arena_pool
    }

    /// Runs the fetch tree and returns the merged document.
    ///
    /// Fetch failures end up in `errors`. Only cancellation and documents that cannot be
    /// merged fail the whole load.
    #[instrument(level = "debug", skip_all, fields(operation_type = %operation_type))]
    pub async fn load(
        &self,
        ctx: &Context,
        operation_type: OperationType,
        fetches: &FetchTreeNode,
    ) -> Result<LoadedResponse, ExecutionError> {
        let env = LoadEnv {
            ctx,
            data_sources: &self.data_sources,
            caches: &self.caches,
            arena_pool: &self.arena_pool,
        };
        let LoaderOutput {
            doc,
            data,
            errors,
            mut traces,
        } = Loader::new(env, operation_type).run(fetches).await?;

        let trace = ctx
            .options
            .trace
            .enabled
            .then(|| FetchTreeTraceNode::build(fetches, &mut traces));
        Ok(LoadedResponse {
            document: doc,
            data,
            errors,
            trace,
        })
    }

    /// Loads the plan's fetches and renders the client response.
    #[instrument(level = "debug", skip_all)]
    pub async fn execute(
        &self,
        ctx: &Context,
        plan: &ResponsePlan,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let started = Instant::now();
        let loaded = self.load(ctx, plan.operation_type, &plan.fetches).await?;
        let resolved = resolve(
            &loaded.document,
            Some(loaded.data),
            &plan.data,
            loaded.errors,
            &ResolveOptions {
                error_behavior: ctx.options.error_behavior,
                operation_type: plan.operation_type,
            },
        );
        let cache_stats = ctx.stats.snapshot();
        debug!(
            elapsed = ?started.elapsed(),
            errors = resolved.errors.len(),
            data_is_null = resolved.data_is_null,
            l2_hits = cache_stats.l2_hits,
            "operation executed"
        );
        Ok(ExecutionOutput {
            body: resolved.body,
            errors: resolved.errors,
            data_is_null: resolved.data_is_null,
            trace: loaded.trace,
            cache_stats,
        })
    }
}
