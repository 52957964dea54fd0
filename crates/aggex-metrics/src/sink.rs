//! Metric sinks: one registered Prometheus metric per [`MetricSpec`].
//!
//! The four shapes (gauge/counter × labeled/unlabeled) are chosen once
//! when the sink is created. The underlying prometheus types are atomic,
//! so `apply` may be called from any number of tasks at once.

use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Opts, Registry};
use thiserror::Error;
use tracing::debug;

use aggex_core::{MetricKind, MetricSpec};

use crate::extract::Observation;

pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Invalid name, invalid label name, or a name already registered.
    #[error("failed to register metric {metric}: {source}")]
    Registration {
        metric: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("counter {metric} cannot be incremented by negative value {value}")]
    NegativeIncrement { metric: String, value: f64 },
}

/// A registered metric, ready to receive observations.
///
/// Labeled variants carry the number of declared label names.
#[derive(Clone)]
pub enum MetricSink {
    Gauge(Gauge),
    Counter(Counter),
    GaugeVec(GaugeVec, usize),
    CounterVec(CounterVec, usize),
}

impl MetricSink {
    /// Create the metric matching the spec's kind and label set and
    /// register it with `registry`.
    pub fn initialize(spec: &MetricSpec, registry: &Registry) -> SinkResult<Self> {
        let registration = |source| SinkError::Registration {
            metric: spec.name.clone(),
            source,
        };
        let opts = Opts::new(spec.name.clone(), spec.help.clone());
        let label_names: Vec<&str> = spec.label_fields.iter().map(String::as_str).collect();

        let sink = match (spec.kind, spec.is_labeled()) {
            (MetricKind::Gauge, false) => {
                MetricSink::Gauge(Gauge::with_opts(opts).map_err(registration)?)
            }
            (MetricKind::Counter, false) => {
                MetricSink::Counter(Counter::with_opts(opts).map_err(registration)?)
            }
            (MetricKind::Gauge, true) => {
                let vec = GaugeVec::new(opts, &label_names).map_err(registration)?;
                MetricSink::GaugeVec(vec, label_names.len())
            }
            (MetricKind::Counter, true) => {
                let vec = CounterVec::new(opts, &label_names).map_err(registration)?;
                MetricSink::CounterVec(vec, label_names.len())
            }
        };

        let collector: Box<dyn prometheus::core::Collector> = match &sink {
            MetricSink::Gauge(m) => Box::new(m.clone()),
            MetricSink::Counter(m) => Box::new(m.clone()),
            MetricSink::GaugeVec(m, _) => Box::new(m.clone()),
            MetricSink::CounterVec(m, _) => Box::new(m.clone()),
        };
        registry.register(collector).map_err(registration)?;

        debug!(metric = %spec.name, kind = %spec.kind, labels = spec.label_fields.len(), "metric registered");
        Ok(sink)
    }

    /// Set (gauge) or add (counter) `value`, on the child selected by
    /// `labels` for labeled sinks.
    ///
    /// # Panics
    ///
    /// If the number of label values differs from the number of declared
    /// label names. The extractor always produces one value per name.
    pub fn apply(&self, name: &str, value: f64, labels: &[String]) -> SinkResult<()> {
        let label_values: Vec<&str> = labels.iter().map(String::as_str).collect();
        assert_eq!(
            label_values.len(),
            self.label_arity(),
            "label value count does not match declared labels for {name}"
        );

        match self {
            MetricSink::Gauge(g) => g.set(value),
            MetricSink::GaugeVec(g, _) => g.with_label_values(&label_values).set(value),
            MetricSink::Counter(c) => {
                check_increment(name, value)?;
                c.inc_by(value);
            }
            MetricSink::CounterVec(c, _) => {
                check_increment(name, value)?;
                c.with_label_values(&label_values).inc_by(value);
            }
        }
        Ok(())
    }

    pub fn observe(&self, name: &str, observation: &Observation) -> SinkResult<()> {
        self.apply(name, observation.value, &observation.labels)
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSink::Gauge(_) | MetricSink::GaugeVec(..) => MetricKind::Gauge,
            MetricSink::Counter(_) | MetricSink::CounterVec(..) => MetricKind::Counter,
        }
    }

    /// Number of label values `apply` expects.
    pub fn label_arity(&self) -> usize {
        match self {
            MetricSink::Gauge(_) | MetricSink::Counter(_) => 0,
            MetricSink::GaugeVec(_, arity) | MetricSink::CounterVec(_, arity) => *arity,
        }
    }
}

fn check_increment(name: &str, value: f64) -> SinkResult<()> {
    if value < 0.0 {
        return Err(SinkError::NegativeIncrement {
            metric: name.to_string(),
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use aggex_core::{Namespace, Pipeline, RefreshPolicy};

    use super::*;

    fn spec(name: &str, kind: MetricKind, labels: &[&str]) -> MetricSpec {
        MetricSpec {
            name: name.to_string(),
            kind,
            help: format!("{name} help"),
            value_field: "v".to_string(),
            label_fields: labels.iter().map(|l| l.to_string()).collect(),
            namespace: Namespace::new("d", "c"),
            pipeline: Pipeline::from_stages(Vec::new()),
            refresh: RefreshPolicy::Interval(Duration::from_secs(5)),
        }
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn unlabeled_gauge_sets() {
        let registry = Registry::new();
        let sink = MetricSink::initialize(&spec("g", MetricKind::Gauge, &[]), &registry).unwrap();
        sink.apply("g", 3.0, &[]).unwrap();
        sink.apply("g", 7.0, &[]).unwrap();

        let MetricSink::Gauge(g) = &sink else {
            panic!("expected unlabeled gauge");
        };
        assert_eq!(g.get(), 7.0);
        assert_eq!(sink.kind(), MetricKind::Gauge);
    }

    #[test]
    fn unlabeled_counter_adds() {
        let registry = Registry::new();
        let sink =
            MetricSink::initialize(&spec("orders_total", MetricKind::Counter, &[]), &registry)
                .unwrap();
        sink.apply("orders_total", 42.0, &[]).unwrap();
        sink.apply("orders_total", 8.0, &[]).unwrap();

        let MetricSink::Counter(c) = &sink else {
            panic!("expected unlabeled counter");
        };
        assert_eq!(c.get(), 50.0);
    }

    #[test]
    fn labeled_gauge_sets_child() {
        let registry = Registry::new();
        let sink =
            MetricSink::initialize(&spec("queue_depth", MetricKind::Gauge, &["region"]), &registry)
                .unwrap();
        sink.apply("queue_depth", 7.0, &labels(&["us-east"])).unwrap();
        sink.apply("queue_depth", 2.0, &labels(&["eu-west"])).unwrap();

        let MetricSink::GaugeVec(g, _) = &sink else {
            panic!("expected labeled gauge");
        };
        assert_eq!(g.with_label_values(&["us-east"]).get(), 7.0);
        assert_eq!(g.with_label_values(&["eu-west"]).get(), 2.0);
    }

    #[test]
    fn labeled_counter_adds_per_child() {
        let registry = Registry::new();
        let sink = MetricSink::initialize(
            &spec("jobs_total", MetricKind::Counter, &["queue", "state"]),
            &registry,
        )
        .unwrap();
        sink.apply("jobs_total", 1.0, &labels(&["mail", "done"])).unwrap();
        sink.apply("jobs_total", 2.0, &labels(&["mail", "done"])).unwrap();
        sink.apply("jobs_total", 5.0, &labels(&["mail", "failed"])).unwrap();

        let MetricSink::CounterVec(c, _) = &sink else {
            panic!("expected labeled counter");
        };
        assert_eq!(c.with_label_values(&["mail", "done"]).get(), 3.0);
        assert_eq!(c.with_label_values(&["mail", "failed"]).get(), 5.0);
    }

    #[test]
    fn duplicate_name_is_registration_error() {
        let registry = Registry::new();
        MetricSink::initialize(&spec("dup", MetricKind::Gauge, &[]), &registry).unwrap();
        let err = MetricSink::initialize(&spec("dup", MetricKind::Counter, &[]), &registry)
            .err()
            .unwrap();
        assert!(matches!(err, SinkError::Registration { ref metric, .. } if metric == "dup"));
    }

    #[test]
    fn invalid_name_is_registration_error() {
        let registry = Registry::new();
        let err = MetricSink::initialize(&spec("bad-name", MetricKind::Gauge, &[]), &registry)
            .err()
            .unwrap();
        assert!(matches!(err, SinkError::Registration { .. }));
    }

    #[test]
    fn negative_counter_increment_rejected() {
        let registry = Registry::new();
        let sink =
            MetricSink::initialize(&spec("c_total", MetricKind::Counter, &[]), &registry).unwrap();
        let err = sink.apply("c_total", -1.0, &[]).unwrap_err();
        assert!(matches!(err, SinkError::NegativeIncrement { .. }));
    }

    #[test]
    fn label_arity_matches_declared_labels() {
        let registry = Registry::new();
        let plain = MetricSink::initialize(&spec("p", MetricKind::Counter, &[]), &registry).unwrap();
        let two = MetricSink::initialize(
            &spec("t", MetricKind::Counter, &["region", "zone"]),
            &registry,
        )
        .unwrap();
        assert_eq!(plain.label_arity(), 0);
        assert_eq!(two.label_arity(), 2);
        two.apply("t", 1.0, &labels(&["eu", "a"])).unwrap();
    }

    #[test]
    #[should_panic(expected = "label value count")]
    fn label_count_mismatch_panics() {
        let registry = Registry::new();
        let sink =
            MetricSink::initialize(&spec("q", MetricKind::Gauge, &["region"]), &registry).unwrap();
        let _ = sink.apply("q", 1.0, &labels(&["a", "b"]));
    }

    #[test]
    fn concurrent_apply_is_consistent() {
        let registry = Registry::new();
        let sink = Arc::new(
            MetricSink::initialize(&spec("hits_total", MetricKind::Counter, &["path"]), &registry)
                .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        sink.apply("hits_total", 1.0, &labels(&["/"])).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let MetricSink::CounterVec(c, _) = sink.as_ref() else {
            panic!("expected labeled counter");
        };
        assert_eq!(c.with_label_values(&["/"]).get(), 800.0);
    }
}
