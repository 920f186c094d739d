#[derive(thiserror::Error, Debug, Clone)]
pub enum DataSourceError {
    #[error("Data source \"{0}\" is not registered")]
    NotFound(String),
    #[error("Failed to load from data source: {0}")]
    LoadFailure(String),
}
