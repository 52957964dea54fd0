//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while initializing or refreshing metrics.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("metric not initialized: {0}")]
    NotInitialized(String),

    #[error("metric initialization failed: {0}")]
    Init(#[from] aggex_metrics::SinkError),

    #[error("backend error: {0}")]
    Backend(#[from] aggex_backend::BackendError),

    #[error("refresh scheduler already started")]
    AlreadyStarted,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
