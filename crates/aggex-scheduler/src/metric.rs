//! Runtime metric: a spec bound to its sink, plus lifecycle state.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use aggex_backend::QueryExecutor;
use aggex_core::{MetricSpec, ResultRecord};
use aggex_metrics::{ExtractError, MetricSink, Registry, SinkError, extract};

use crate::error::{SchedulerError, SchedulerResult};

/// Lifecycle of a single metric.
///
/// `Uninitialized → Initialized → {Polling | AwaitingChange} ⇄ Refreshing`,
/// ending in `Failed` (sink could not be created) or `Stopped` (refresh or
/// subscription failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetricState {
    Uninitialized = 0,
    Initialized = 1,
    Polling = 2,
    AwaitingChange = 3,
    Refreshing = 4,
    Failed = 5,
    Stopped = 6,
}

impl MetricState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MetricState::Initialized,
            2 => MetricState::Polling,
            3 => MetricState::AwaitingChange,
            4 => MetricState::Refreshing,
            5 => MetricState::Failed,
            6 => MetricState::Stopped,
            _ => MetricState::Uninitialized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricState::Uninitialized => "uninitialized",
            MetricState::Initialized => "initialized",
            MetricState::Polling => "polling",
            MetricState::AwaitingChange => "awaiting_change",
            MetricState::Refreshing => "refreshing",
            MetricState::Failed => "failed",
            MetricState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MetricState::Failed | MetricState::Stopped)
    }
}

impl std::fmt::Display for MetricState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records applied and skipped during one refresh.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub applied: usize,
    pub skipped: usize,
}

/// Why a single record was skipped.
#[derive(Debug, Error)]
enum RecordError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A [`MetricSpec`] plus the sink it writes to once initialized.
pub struct Metric {
    spec: MetricSpec,
    /// Unset until initialization succeeds.
    sink: OnceLock<MetricSink>,
    state: AtomicU8,
    /// Serializes refreshes of this metric.
    refresh_lock: Mutex<()>,
}

impl Metric {
    pub fn new(spec: MetricSpec) -> Self {
        Self {
            spec,
            sink: OnceLock::new(),
            state: AtomicU8::new(MetricState::Uninitialized as u8),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn spec(&self) -> &MetricSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> MetricState {
        MetricState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.sink.get().is_some()
    }

    /// Eligible for scheduling: initialized and not stopped.
    pub fn is_active(&self) -> bool {
        self.is_initialized() && !self.state().is_terminal()
    }

    /// Create and register the sink. A failure marks the metric `Failed`.
    pub fn initialize(&self, registry: &Registry) -> SchedulerResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        match MetricSink::initialize(&self.spec, registry) {
            Ok(sink) => {
                let _ = self.sink.set(sink);
                self.set_state(MetricState::Initialized);
                Ok(())
            }
            Err(e) => {
                self.set_state(MetricState::Failed);
                Err(e.into())
            }
        }
    }

    /// Run the pipeline and apply every record to the sink.
    ///
    /// Records that cannot be extracted or applied are logged and skipped.
    /// Backend errors (opening the cursor or mid-stream) abort the refresh
    /// and are returned unmodified.
    pub async fn refresh(&self, executor: &dyn QueryExecutor) -> SchedulerResult<RefreshOutcome> {
        let sink = self
            .sink
            .get()
            .ok_or_else(|| SchedulerError::NotInitialized(self.spec.name.clone()))?;

        let _guard = self.refresh_lock.lock().await;
        self.begin_refresh();
        let result = self.run_pipeline(executor, sink).await;
        self.end_refresh();

        if let Ok(outcome) = &result {
            debug!(
                metric = %self.spec.name,
                applied = outcome.applied,
                skipped = outcome.skipped,
                "metric refreshed"
            );
        }
        result
    }

    /// Move to `Stopped`. `Failed` is kept as is.
    pub fn stop(&self) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (MetricState::from_u8(s) != MetricState::Failed).then_some(MetricState::Stopped as u8)
        });
    }

    /// `Initialized → Polling | AwaitingChange`.
    pub(crate) fn mark_scheduled(&self) {
        let _ = self.state.compare_exchange(
            MetricState::Initialized as u8,
            self.resting_state() as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    async fn run_pipeline(
        &self,
        executor: &dyn QueryExecutor,
        sink: &MetricSink,
    ) -> SchedulerResult<RefreshOutcome> {
        let spec = &self.spec;
        debug!(metric = %spec.name, pipeline = %spec.pipeline, "aggregate pipeline");

        let mut records = executor.run(&spec.namespace, &spec.pipeline).await?;
        let mut outcome = RefreshOutcome::default();

        while let Some(record) = records.next().await {
            let record = record?;
            debug!(metric = %spec.name, %record, "found record");

            match self.apply_record(sink, &record) {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    error!(metric = %spec.name, error = %e, "failed to update record");
                    outcome.skipped += 1;
                }
            }
        }

        Ok(outcome)
    }

    fn apply_record(&self, sink: &MetricSink, record: &ResultRecord) -> Result<(), RecordError> {
        let observation = extract(record, &self.spec)?;
        sink.observe(&self.spec.name, &observation)?;
        Ok(())
    }

    fn resting_state(&self) -> MetricState {
        if self.spec.is_realtime() {
            MetricState::AwaitingChange
        } else {
            MetricState::Polling
        }
    }

    fn set_state(&self, state: MetricState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn begin_refresh(&self) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (!MetricState::from_u8(s).is_terminal()).then_some(MetricState::Refreshing as u8)
        });
    }

    fn end_refresh(&self) {
        let _ = self.state.compare_exchange(
            MetricState::Refreshing as u8,
            self.resting_state() as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use aggex_backend::{BackendError, MemoryBackend};
    use aggex_core::{MetricKind, Namespace, Pipeline, RefreshPolicy};

    use super::*;

    fn spec(name: &str, kind: MetricKind, labels: &[&str], refresh: RefreshPolicy) -> MetricSpec {
        MetricSpec {
            name: name.to_string(),
            kind,
            help: format!("{name} help"),
            value_field: "value".to_string(),
            label_fields: labels.iter().map(|l| l.to_string()).collect(),
            namespace: Namespace::new("db", "coll"),
            pipeline: Pipeline::from_stages(Vec::new()),
            refresh,
        }
    }

    fn polled(name: &str) -> Metric {
        Metric::new(spec(
            name,
            MetricKind::Gauge,
            &[],
            RefreshPolicy::Interval(Duration::from_secs(5)),
        ))
    }

    fn ns() -> Namespace {
        Namespace::new("db", "coll")
    }

    #[test]
    fn initialize_moves_to_initialized() {
        let metric = polled("up");
        assert_eq!(metric.state(), MetricState::Uninitialized);
        assert!(!metric.is_active());

        metric.initialize(&Registry::new()).unwrap();
        assert_eq!(metric.state(), MetricState::Initialized);
        assert!(metric.is_active());
    }

    #[test]
    fn failed_initialize_is_terminal() {
        let registry = Registry::new();
        polled("dup").initialize(&registry).unwrap();

        let second = polled("dup");
        assert!(matches!(
            second.initialize(&registry),
            Err(SchedulerError::Init(_))
        ));
        assert_eq!(second.state(), MetricState::Failed);
        assert!(!second.is_active());

        second.stop();
        assert_eq!(second.state(), MetricState::Failed);
    }

    #[tokio::test]
    async fn refresh_requires_initialization() {
        let metric = polled("up");
        let err = metric.refresh(&MemoryBackend::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotInitialized(ref n) if n == "up"));
    }

    #[tokio::test]
    async fn refresh_applies_and_skips() {
        let backend = MemoryBackend::new();
        backend
            .set_results(
                &ns(),
                vec![
                    ResultRecord::new().with("value", 3),
                    ResultRecord::new().with("value", "three"),
                    ResultRecord::new().with("other", 1),
                    ResultRecord::new().with("value", 4i64),
                ],
            )
            .await;

        let metric = polled("g");
        metric.initialize(&Registry::new()).unwrap();
        metric.mark_scheduled();

        let outcome = metric.refresh(&backend).await.unwrap();
        assert_eq!(outcome, RefreshOutcome { applied: 2, skipped: 2 });
        assert_eq!(metric.state(), MetricState::Polling);
    }

    #[tokio::test]
    async fn negative_counter_value_is_skipped() {
        let backend = MemoryBackend::new();
        backend
            .set_results(&ns(), vec![ResultRecord::new().with("value", -5)])
            .await;

        let metric = Metric::new(spec("c_total", MetricKind::Counter, &[], RefreshPolicy::Realtime));
        metric.initialize(&Registry::new()).unwrap();

        let outcome = metric.refresh(&backend).await.unwrap();
        assert_eq!(outcome, RefreshOutcome { applied: 0, skipped: 1 });
        assert_eq!(metric.state(), MetricState::AwaitingChange);
    }

    #[tokio::test]
    async fn backend_errors_are_returned() {
        let backend = MemoryBackend::new();
        backend.fail_queries(&ns(), "boom").await;

        let metric = polled("g");
        metric.initialize(&Registry::new()).unwrap();

        let err = metric.refresh(&backend).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Backend(BackendError::Query(ref m)) if m == "boom"));
    }

    #[tokio::test]
    async fn mid_stream_error_aborts_refresh() {
        let backend = MemoryBackend::new();
        backend
            .set_stream(
                &ns(),
                vec![
                    Ok(ResultRecord::new().with("value", 1)),
                    Err(BackendError::Stream("cursor killed".to_string())),
                    Ok(ResultRecord::new().with("value", 2)),
                ],
            )
            .await;

        let metric = polled("g");
        metric.initialize(&Registry::new()).unwrap();
        assert!(matches!(
            metric.refresh(&backend).await,
            Err(SchedulerError::Backend(BackendError::Stream(_)))
        ));
    }

    #[tokio::test]
    async fn stop_is_sticky_across_refresh() {
        let backend = MemoryBackend::new();
        let metric = polled("g");
        metric.initialize(&Registry::new()).unwrap();

        metric.stop();
        metric.refresh(&backend).await.unwrap();
        assert_eq!(metric.state(), MetricState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_are_serialized() {
        let backend = MemoryBackend::new().with_query_delay(Duration::from_secs(1));
        let metric = Arc::new(Metric::new(spec(
            "c_total",
            MetricKind::Counter,
            &[],
            RefreshPolicy::Realtime,
        )));
        metric.initialize(&Registry::new()).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let metric = metric.clone();
                let backend = backend.clone();
                tokio::spawn(async move { metric.refresh(&backend).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(backend.query_count(&ns()).await, 1);
        assert_eq!(metric.state(), MetricState::Refreshing);

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(backend.query_count(&ns()).await, 2);
        assert_eq!(metric.state(), MetricState::AwaitingChange);
    }
}
