//! The refresh scheduler owns every metric and every background task.
//!
//! Startup runs one initialization pass over all specs, then spawns:
//! - an interval loop per polled metric (its first iteration is the
//!   immediate initial refresh),
//! - an initial refresh per realtime metric,
//! - a subscription loop per distinct realtime namespace.
//!
//! All task handles are kept; `shutdown()` (or dropping the scheduler)
//! stops them together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use aggex_backend::{ChangeSubscriber, QueryExecutor};
use aggex_core::{MetricSpec, RefreshPolicy};
use aggex_metrics::Registry;

use crate::error::{SchedulerError, SchedulerResult};
use crate::metric::{Metric, MetricState, RefreshOutcome};
use crate::subscription::{SubscriptionRegistry, run_subscription_loop};

/// Result of the initialization pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub initialized: Vec<String>,
    /// (metric name, error message)
    pub failed: Vec<(String, String)>,
}

/// A spawned background task.
struct TaskSlot {
    label: String,
    handle: JoinHandle<()>,
}

pub struct RefreshScheduler {
    executor: Arc<dyn QueryExecutor>,
    subscriber: Arc<dyn ChangeSubscriber>,
    /// Where every metric sink is registered.
    registry: Registry,
    metrics: Vec<Arc<Metric>>,
    subscriptions: SubscriptionRegistry,
    tasks: Vec<TaskSlot>,
    shutdown_tx: watch::Sender<bool>,
    init_report: Option<InitReport>,
    started: bool,
}

impl RefreshScheduler {
    /// Create a scheduler. Nothing is registered or spawned yet.
    pub fn new(
        specs: Vec<MetricSpec>,
        executor: Arc<dyn QueryExecutor>,
        subscriber: Arc<dyn ChangeSubscriber>,
        registry: Registry,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            subscriber,
            registry,
            metrics: specs.into_iter().map(|s| Arc::new(Metric::new(s))).collect(),
            subscriptions: SubscriptionRegistry::new(),
            tasks: Vec::new(),
            shutdown_tx,
            init_report: None,
            started: false,
        }
    }

    /// Create a scheduler whose backend provides both capabilities.
    pub fn with_backend<B>(specs: Vec<MetricSpec>, backend: Arc<B>, registry: Registry) -> Self
    where
        B: QueryExecutor + ChangeSubscriber + 'static,
    {
        Self::new(specs, backend.clone(), backend, registry)
    }

    /// Register a sink for every metric. Runs once; later calls return the
    /// first report. A failing metric is excluded, the rest continue.
    pub fn initialize(&mut self) -> InitReport {
        if let Some(report) = &self.init_report {
            return report.clone();
        }

        if self.metrics.is_empty() {
            warn!("no metrics have been configured");
        }

        let mut report = InitReport::default();
        for metric in &self.metrics {
            info!(metric = %metric.name(), "initialize metric");
            match metric.initialize(&self.registry) {
                Ok(()) => report.initialized.push(metric.name().to_string()),
                Err(e) => {
                    error!(metric = %metric.name(), error = %e, "failed to initialize metric");
                    report.failed.push((metric.name().to_string(), e.to_string()));
                }
            }
        }

        self.init_report = Some(report.clone());
        report
    }

    /// Initialize (if needed) and spawn every refresh task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> SchedulerResult<InitReport> {
        if self.started {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.started = true;
        let report = self.initialize();

        let active: Vec<Arc<Metric>> = self
            .metrics
            .iter()
            .filter(|m| m.is_active())
            .cloned()
            .collect();
        let (realtime, polled): (Vec<_>, Vec<_>) =
            active.into_iter().partition(|m| m.spec().is_realtime());

        for metric in polled {
            let RefreshPolicy::Interval(interval) = metric.spec().refresh else {
                continue;
            };
            metric.mark_scheduled();
            let label = format!("interval:{}", metric.name());
            let executor = self.executor.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.spawn(
                label,
                run_interval_loop(metric, executor, interval, shutdown),
            );
        }

        for metric in &realtime {
            metric.mark_scheduled();
            let label = format!("initial:{}", metric.name());
            let metric = metric.clone();
            let executor = self.executor.clone();
            self.spawn(label, async move {
                if let Err(e) = metric.refresh(executor.as_ref()).await {
                    error!(metric = %metric.name(), error = %e, "failed to fetch initial value");
                }
            });
        }

        // Every namespace is known before the first subscription opens.
        self.subscriptions =
            SubscriptionRegistry::from_metrics(realtime.iter().map(|m| m.as_ref()));
        let realtime: Arc<[Arc<Metric>]> = realtime.into();
        let namespaces: Vec<_> = self.subscriptions.iter().cloned().collect();
        for namespace in namespaces {
            let label = format!("subscription:{namespace}");
            let task = run_subscription_loop(
                namespace,
                realtime.clone(),
                self.executor.clone(),
                self.subscriber.clone(),
                self.shutdown_tx.subscribe(),
            );
            self.spawn(label, task);
        }

        info!(
            metrics = self.metrics.len(),
            failed = report.failed.len(),
            subscriptions = self.subscriptions.len(),
            tasks = self.tasks.len(),
            "refresh scheduler started"
        );
        Ok(report)
    }

    /// Refresh every initialized metric once, in order. Used for dry runs.
    pub async fn refresh_all(&mut self) -> Vec<(String, SchedulerResult<RefreshOutcome>)> {
        self.initialize();
        let mut results = Vec::with_capacity(self.metrics.len());
        for metric in self.metrics.iter().filter(|m| m.is_active()) {
            let result = metric.refresh(self.executor.as_ref()).await;
            if let Err(e) = &result {
                error!(metric = %metric.name(), error = %e, "failed to refresh metric");
            }
            results.push((metric.name().to_string(), result));
        }
        results
    }

    /// Stop every background task and wait for it to finish.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for slot in self.tasks.drain(..) {
            slot.handle.abort();
            let _ = slot.handle.await;
            debug!(task = %slot.label, "refresh task stopped");
        }
        info!("refresh scheduler stopped");
    }

    /// State of the first metric named `name`.
    pub fn state(&self, name: &str) -> Option<MetricState> {
        self.metrics
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.state())
    }

    pub fn states(&self) -> Vec<(String, MetricState)> {
        self.metrics
            .iter()
            .map(|m| (m.name().to_string(), m.state()))
            .collect()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Labels of spawned tasks that have not finished.
    pub fn running_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.label.clone())
            .collect()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn spawn<F>(&mut self, label: String, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task = %label, "spawning refresh task");
        let handle = tokio::spawn(task);
        self.tasks.push(TaskSlot { label, handle });
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        for slot in &self.tasks {
            slot.handle.abort();
        }
    }
}

/// Refresh, sleep, repeat. The first failed refresh ends the loop and the
/// metric stops updating.
async fn run_interval_loop(
    metric: Arc<Metric>,
    executor: Arc<dyn QueryExecutor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = metric.refresh(executor.as_ref()).await {
            error!(metric = %metric.name(), error = %e, "failed to handle metric, abort listen on metric");
            metric.stop();
            return;
        }

        debug!(metric = %metric.name(), interval_secs = interval.as_secs(), "wait to refresh metric");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!(metric = %metric.name(), "interval loop shutting down");
                return;
            }
        }
    }
}
