//! Error types for backend operations.

use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by a backend. Messages are the backend's own,
/// passed through unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("failed to open change stream: {0}")]
    Subscribe(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid pipeline: {0}")]
    Pipeline(String),
}

/// Convert any `Display` error into a `BackendError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::BackendError::$variant(e.to_string())
    };
}

pub(crate) use map_err;
