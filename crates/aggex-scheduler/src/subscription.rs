//! Change subscriptions, one per distinct (database, collection).

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info};

use aggex_backend::{ChangeSubscriber, QueryExecutor};
use aggex_core::{ChangeEvent, Namespace};

use crate::metric::Metric;

/// Namespaces with a live change subscription.
///
/// Filled in a single pass over all realtime metrics before any
/// subscription is opened; entries are never removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    namespaces: BTreeSet<Namespace>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the distinct namespaces of every active realtime metric.
    pub fn from_metrics<'a>(metrics: impl IntoIterator<Item = &'a Metric>) -> Self {
        let mut registry = Self::new();
        for metric in metrics {
            if metric.spec().is_realtime() && metric.is_active() {
                registry.register(&metric.spec().namespace);
            }
        }
        registry
    }

    /// Returns `false` if the namespace was already registered.
    pub fn register(&mut self, namespace: &Namespace) -> bool {
        self.namespaces.insert(namespace.clone())
    }

    pub fn contains(&self, namespace: &Namespace) -> bool {
        self.namespaces.contains(namespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.iter()
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

/// Refresh every realtime metric bound to the event's namespace.
///
/// A failing refresh is logged and does not stop the others. Returns the
/// number of metrics refreshed successfully.
pub(crate) async fn dispatch(
    event: &ChangeEvent,
    metrics: &[Arc<Metric>],
    executor: &dyn QueryExecutor,
) -> usize {
    let mut refreshed = 0;
    for metric in metrics {
        let spec = metric.spec();
        if !spec.is_realtime() || spec.namespace != event.namespace || !metric.is_active() {
            continue;
        }
        match metric.refresh(executor).await {
            Ok(_) => refreshed += 1,
            Err(e) => {
                error!(metric = %spec.name, error = %e, "failed to update metric");
            }
        }
    }
    refreshed
}

/// Watch one namespace and fan change events out to matching metrics.
///
/// The subscription is not reopened: when it fails or ends, every metric
/// bound to the namespace moves to `Stopped`.
pub(crate) async fn run_subscription_loop(
    namespace: Namespace,
    metrics: Arc<[Arc<Metric>]>,
    executor: Arc<dyn QueryExecutor>,
    subscriber: Arc<dyn ChangeSubscriber>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(%namespace, "start change stream, waiting for changes");

    let mut events = match subscriber.watch(&namespace).await {
        Ok(events) => events,
        Err(e) => {
            error!(%namespace, error = %e, "failed to start change stream listener");
            stop_bound(&namespace, &metrics);
            return;
        }
    };

    loop {
        tokio::select! {
            next = events.next() => match next {
                Some(Ok(event)) => {
                    debug!(%namespace, source = %event.namespace, "change stream event");
                    dispatch(&event, &metrics, executor.as_ref()).await;
                }
                Some(Err(e)) => {
                    error!(%namespace, error = %e, "change stream failed, realtime updates stop");
                    break;
                }
                None => {
                    error!(%namespace, "change stream closed, realtime updates stop");
                    break;
                }
            },
            _ = shutdown.changed() => {
                debug!(%namespace, "change stream listener shutting down");
                return;
            }
        }
    }

    stop_bound(&namespace, &metrics);
}

fn stop_bound(namespace: &Namespace, metrics: &[Arc<Metric>]) {
    for metric in metrics
        .iter()
        .filter(|m| m.spec().is_realtime() && m.spec().namespace == *namespace)
    {
        metric.stop();
    }
}
