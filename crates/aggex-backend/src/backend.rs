//! Capability traits the refresh engine is written against.

use async_trait::async_trait;
use futures::stream::BoxStream;

use aggex_core::{ChangeEvent, Namespace, Pipeline, ResultRecord};

use crate::error::BackendResult;

/// A finite, non-restartable sequence of result records. Dropping the
/// stream releases the underlying cursor.
pub type RecordStream = BoxStream<'static, BackendResult<ResultRecord>>;

/// An unbounded sequence of change events. It ends only when closed or
/// when the backend connection fails.
pub type ChangeStream = BoxStream<'static, BackendResult<ChangeEvent>>;

/// Runs stored aggregation pipelines.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Open a fresh cursor for `pipeline` against `namespace`.
    async fn run(&self, namespace: &Namespace, pipeline: &Pipeline) -> BackendResult<RecordStream>;
}

/// Opens change notification subscriptions.
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    async fn watch(&self, namespace: &Namespace) -> BackendResult<ChangeStream>;
}
