//! In-memory backend with scripted query results and change events.
//!
//! Stands in for a real data store in tests. Queries against
//! a namespace replay whatever was scripted for it (an empty result when
//! nothing was), and change events are pushed by calling [`MemoryBackend::notify`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use tokio::sync::Mutex;
use tracing::debug;

use aggex_core::{ChangeEvent, Namespace, Pipeline, ResultRecord};

use crate::backend::{ChangeStream, ChangeSubscriber, QueryExecutor, RecordStream};
use crate::error::{BackendError, BackendResult};

#[derive(Default)]
struct Inner {
    /// Items replayed by every query against a namespace.
    streams: HashMap<Namespace, Vec<BackendResult<ResultRecord>>>,
    /// Namespaces whose queries fail before yielding a cursor.
    query_failures: HashMap<Namespace, String>,
    subscribe_failures: HashMap<Namespace, String>,
    watchers: HashMap<Namespace, Vec<UnboundedSender<BackendResult<ChangeEvent>>>>,
    query_counts: HashMap<Namespace, usize>,
    watch_counts: HashMap<Namespace, usize>,
    /// Every namespace ever queried, for assertions on isolation.
    queried: HashSet<Namespace>,
}

/// Thread-safe scripted backend. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    query_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every query by `delay` before returning its cursor.
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }

    /// Replace the records returned for `namespace`.
    pub async fn set_results(&self, namespace: &Namespace, records: Vec<ResultRecord>) {
        self.set_stream(namespace, records.into_iter().map(Ok).collect())
            .await;
    }

    /// Replace the raw items (records or mid-stream errors) returned for
    /// `namespace`.
    pub async fn set_stream(&self, namespace: &Namespace, items: Vec<BackendResult<ResultRecord>>) {
        let mut inner = self.inner.lock().await;
        inner.query_failures.remove(namespace);
        inner.streams.insert(namespace.clone(), items);
    }

    /// Make queries against `namespace` fail with `message`.
    pub async fn fail_queries(&self, namespace: &Namespace, message: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .query_failures
            .insert(namespace.clone(), message.to_string());
    }

    /// Make subscriptions to `namespace` fail with `message`.
    pub async fn fail_subscriptions(&self, namespace: &Namespace, message: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .subscribe_failures
            .insert(namespace.clone(), message.to_string());
    }

    /// Deliver a change event for `namespace` to every open subscription on
    /// it. Returns the number of subscriptions reached.
    pub async fn notify(&self, namespace: &Namespace) -> usize {
        let mut inner = self.inner.lock().await;
        let Some(senders) = inner.watchers.get_mut(namespace) else {
            return 0;
        };
        senders.retain(|tx| {
            tx.unbounded_send(Ok(ChangeEvent::new(namespace.clone())))
                .is_ok()
        });
        debug!(%namespace, delivered = senders.len(), "change event published");
        senders.len()
    }

    /// End every subscription on `namespace`, optionally with a final error.
    pub async fn close_subscriptions(&self, namespace: &Namespace, error: Option<&str>) {
        let mut inner = self.inner.lock().await;
        if let Some(senders) = inner.watchers.remove(namespace) {
            for tx in senders {
                if let Some(message) = error {
                    let _ = tx.unbounded_send(Err(BackendError::Stream(message.to_string())));
                }
                tx.close_channel();
            }
        }
    }

    pub async fn query_count(&self, namespace: &Namespace) -> usize {
        let inner = self.inner.lock().await;
        inner.query_counts.get(namespace).copied().unwrap_or(0)
    }

    /// Number of subscriptions ever opened on `namespace`.
    pub async fn watch_count(&self, namespace: &Namespace) -> usize {
        let inner = self.inner.lock().await;
        inner.watch_counts.get(namespace).copied().unwrap_or(0)
    }

    /// Number of subscriptions on `namespace` whose receiver is still alive.
    pub async fn open_subscriptions(&self, namespace: &Namespace) -> usize {
        let inner = self.inner.lock().await;
        inner
            .watchers
            .get(namespace)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub async fn was_queried(&self, namespace: &Namespace) -> bool {
        self.inner.lock().await.queried.contains(namespace)
    }
}

#[async_trait]
impl QueryExecutor for MemoryBackend {
    async fn run(&self, namespace: &Namespace, pipeline: &Pipeline) -> BackendResult<RecordStream> {
        if let Some(delay) = self.query_delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        *inner.query_counts.entry(namespace.clone()).or_insert(0) += 1;
        inner.queried.insert(namespace.clone());
        debug!(%namespace, stages = pipeline.stages().len(), "in-memory aggregate");

        if let Some(message) = inner.query_failures.get(namespace) {
            return Err(BackendError::Query(message.clone()));
        }
        let items = inner.streams.get(namespace).cloned().unwrap_or_default();
        Ok(futures::stream::iter(items).boxed())
    }
}

#[async_trait]
impl ChangeSubscriber for MemoryBackend {
    async fn watch(&self, namespace: &Namespace) -> BackendResult<ChangeStream> {
        let mut inner = self.inner.lock().await;
        *inner.watch_counts.entry(namespace.clone()).or_insert(0) += 1;

        if let Some(message) = inner.subscribe_failures.get(namespace) {
            return Err(BackendError::Subscribe(message.clone()));
        }

        let (tx, rx) = unbounded();
        inner
            .watchers
            .entry(namespace.clone())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    fn pipeline() -> Pipeline {
        Pipeline::from_stages(Vec::new())
    }

    #[tokio::test]
    async fn unscripted_namespace_returns_nothing() {
        let backend = MemoryBackend::new();
        let records: Vec<ResultRecord> = backend
            .run(&ns(), &pipeline())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(backend.query_count(&ns()).await, 1);
        assert!(backend.was_queried(&ns()).await);
    }

    #[tokio::test]
    async fn scripted_results_replay_on_every_query() {
        let backend = MemoryBackend::new();
        backend
            .set_results(&ns(), vec![ResultRecord::new().with("count", 42i64)])
            .await;

        for _ in 0..2 {
            let records: Vec<ResultRecord> = backend
                .run(&ns(), &pipeline())
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            assert_eq!(records.len(), 1);
        }
        assert_eq!(backend.query_count(&ns()).await, 2);
    }

    #[tokio::test]
    async fn query_failure_is_surfaced() {
        let backend = MemoryBackend::new();
        backend.fail_queries(&ns(), "connection reset").await;
        let err = backend.run(&ns(), &pipeline()).await.err().unwrap();
        assert_eq!(err, BackendError::Query("connection reset".to_string()));
    }

    #[tokio::test]
    async fn notify_reaches_open_subscriptions() {
        let backend = MemoryBackend::new();
        let mut stream = backend.watch(&ns()).await.unwrap();

        assert_eq!(backend.notify(&ns()).await, 1);
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.namespace, ns());

        // Other namespaces are unaffected.
        assert_eq!(backend.notify(&Namespace::new("shop", "users")).await, 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let backend = MemoryBackend::new();
        let stream = backend.watch(&ns()).await.unwrap();
        assert_eq!(backend.open_subscriptions(&ns()).await, 1);

        drop(stream);
        assert_eq!(backend.notify(&ns()).await, 0);
        assert_eq!(backend.open_subscriptions(&ns()).await, 0);
        assert_eq!(backend.watch_count(&ns()).await, 1);
    }

    #[tokio::test]
    async fn close_with_error_ends_stream() {
        let backend = MemoryBackend::new();
        let mut stream = backend.watch(&ns()).await.unwrap();

        backend.close_subscriptions(&ns(), Some("network down")).await;
        assert!(matches!(stream.next().await, Some(Err(BackendError::Stream(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_failure_is_surfaced() {
        let backend = MemoryBackend::new();
        backend.fail_subscriptions(&ns(), "not a replica set").await;
        assert!(matches!(
            backend.watch(&ns()).await,
            Err(BackendError::Subscribe(_))
        ));
    }
}
