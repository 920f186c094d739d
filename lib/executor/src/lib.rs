pub mod arena;
pub mod cache;
pub mod context;
pub mod execution;
pub mod executors;
pub mod fetch;
pub mod json_writer;
pub mod resolve;
pub mod response;
pub mod skip_fetch;
pub mod tainted;
pub mod utils;

#[cfg(test)]
mod testing;

pub use arena::{ArenaPool, ArenaPoolConfig};
pub use cache::{InMemoryLoaderCache, LoaderCache, LoaderCaches};
pub use context::{CachingOptions, Context, ExecutionOptions};
pub use execution::{
    error::ExecutionError,
    plan::{ExecutionOutput, FetchLoader, LoadedResponse, ResponsePlan},
    trace::TraceOptions,
};
pub use executors::{common::DataSource, error::DataSourceError, map::DataSourceMap};
pub use resolve::ErrorBehavior;
