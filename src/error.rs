//! Error types for relay.

use thiserror::Error;

use crate::engine::ValidationError;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// relay error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Flow error: {0}")]
    Flow(String),

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Validation(ValidationError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
