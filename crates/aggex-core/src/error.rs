//! Configuration and metric definition errors.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for config operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading the config file or validating a metric.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("metric {metric}: unknown metric type {kind:?}, expected gauge or counter")]
    UnknownKind { metric: String, kind: String },

    #[error("metric {metric}: {field} must not be empty")]
    EmptyField {
        metric: String,
        field: &'static str,
    },

    #[error("metric {metric}: invalid pipeline: {source}")]
    InvalidPipeline {
        metric: String,
        #[source]
        source: PipelineError,
    },
}

/// Reasons a pipeline string is rejected.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pipeline must be a JSON array of stages")]
    NotAnArray,

    #[error("stage {0} is not a JSON object")]
    StageNotObject(usize),
}
