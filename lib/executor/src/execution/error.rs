use crate::response::merge::MergeError;

/// Failures that abort the whole execution. Everything else ends up in the response
/// `errors` array.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("unable to merge results from subgraph {subgraph}: {source}")]
    Merge { subgraph: String, source: MergeError },
    #[error("execution was cancelled")]
    Cancelled,
}
