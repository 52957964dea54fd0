//! Turning query results into Prometheus observations.
//!
//! # Architecture
//!
//! ```text
//! ResultRecord
//!   └── extract() → Observation { value, labels }   (pure, may fail per record)
//!
//! MetricSink (one per metric, registered once)
//!   ├── Gauge / Counter          ← unlabeled
//!   ├── GaugeVec / CounterVec    ← labeled, child resolved per observation
//!   └── apply(value, labels)
//!
//! Exposition
//!   └── render(&Registry) → text/plain for scrapers
//! ```

pub mod exposition;
pub mod extract;
pub mod sink;

pub use exposition::{CONTENT_TYPE, render};
pub use extract::{ExtractError, ExtractResult, Observation, extract, extract_labels, extract_value};
pub use sink::{MetricSink, SinkError, SinkResult};

pub use prometheus::Registry;
