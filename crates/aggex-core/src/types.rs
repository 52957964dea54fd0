//! Domain types shared by every aggex crate.
//!
//! A [`MetricSpec`] is built once at startup from config and never mutated.
//! [`ResultRecord`] and [`ChangeEvent`] are ephemeral values handed from the
//! backend to the refresh engine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Fallback refresh interval when neither the metric nor the global
/// options set one.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

// ── Source ─────────────────────────────────────────────────────────

/// A (database, collection) pair. Both queries and change notifications
/// are addressed by namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

// ── Metric definition ──────────────────────────────────────────────

/// The two supported metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(other.to_string()),
        }
    }
}

/// When a metric is recomputed. A metric is either polled or notified,
/// never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Re-run the query, then sleep for the interval, forever.
    Interval(Duration),
    /// Re-run the query whenever the source namespace reports a change.
    Realtime,
}

impl RefreshPolicy {
    pub fn is_realtime(&self) -> bool {
        matches!(self, RefreshPolicy::Realtime)
    }
}

/// An aggregation pipeline: an ordered list of stage documents.
///
/// Stored as JSON objects (extended JSON is allowed) so this crate stays
/// independent of any backend's document type.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<serde_json::Value>,
}

impl Pipeline {
    /// Parse a JSON array of stage objects.
    pub fn parse(json: &str) -> Result<Self, PipelineError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let serde_json::Value::Array(stages) = value else {
            return Err(PipelineError::NotAnArray);
        };
        if let Some(idx) = stages.iter().position(|s| !s.is_object()) {
            return Err(PipelineError::StageNotObject(idx));
        }
        Ok(Self { stages })
    }

    pub fn from_stages(stages: Vec<serde_json::Value>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[serde_json::Value] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::Value::Array(self.stages.clone());
        write!(f, "{json}")
    }
}

/// Immutable definition of one exported metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub name: String,
    pub kind: MetricKind,
    pub help: String,
    /// Result field holding the numeric value.
    pub value_field: String,
    /// Result fields holding label values, in label declaration order.
    pub label_fields: Vec<String>,
    pub namespace: Namespace,
    pub pipeline: Pipeline,
    pub refresh: RefreshPolicy,
}

impl MetricSpec {
    pub fn is_labeled(&self) -> bool {
        !self.label_fields.is_empty()
    }

    pub fn is_realtime(&self) -> bool {
        self.refresh.is_realtime()
    }
}

// ── Query results ──────────────────────────────────────────────────

/// A dynamically typed scalar taken from a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    /// Any other backend type, by name.
    Other(String),
}

impl Scalar {
    pub fn type_name(&self) -> &str {
        match self {
            Scalar::Int32(_) => "int32",
            Scalar::Int64(_) => "int64",
            Scalar::Double(_) => "double",
            Scalar::String(_) => "string",
            Scalar::Other(name) => name,
        }
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int32(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int64(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Double(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::String(v)
    }
}

/// One row of a query result: field name → scalar, in result order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord {
    fields: Vec<(String, Scalar)>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mainly for tests and adapters.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.insert(field, value);
        self
    }

    /// Insert a field, replacing an existing value in place.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Scalar>) {
        let field = field.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Scalar> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for ResultRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = ResultRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Scalar::Int32(v) => write!(f, "{name}: {v}")?,
                Scalar::Int64(v) => write!(f, "{name}: {v}")?,
                Scalar::Double(v) => write!(f, "{name}: {v}")?,
                Scalar::String(v) => write!(f, "{name}: {v:?}")?,
                Scalar::Other(t) => write!(f, "{name}: <{t}>")?,
            }
        }
        f.write_str("}")
    }
}

// ── Change notifications ───────────────────────────────────────────

/// A data mutation reported by the backend for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub namespace: Namespace,
}

impl ChangeEvent {
    pub fn new(namespace: Namespace) -> Self {
        Self { namespace }
    }
}
