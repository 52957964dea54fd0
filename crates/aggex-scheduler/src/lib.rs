//! Decides when each metric is recomputed.
//!
//! Every metric is either polled on a fixed interval or refreshed when its
//! source namespace reports a change, never both.
//!
//! # Architecture
//!
//! ```text
//! RefreshScheduler
//!   ├── initialize()  → register one MetricSink per spec (failures isolated)
//!   ├── Interval loop per polled metric
//!   │   └── refresh → sleep(interval) → refresh …   (stops on first error)
//!   ├── Subscription loop per distinct (database, collection)
//!   │   └── ChangeEvent → refresh every realtime metric on that namespace
//!   └── shutdown()    → signal + abort every owned task
//!
//! Metric::refresh
//!   QueryExecutor::run → extract() per record → MetricSink::apply
//! ```
//!
//! Refreshes of one metric are serialized by a per-metric lock, so an
//! initial refresh and a change-triggered one never overlap.

pub mod error;
pub mod metric;
pub mod scheduler;
pub mod subscription;

pub use error::{SchedulerError, SchedulerResult};
pub use metric::{Metric, MetricState, RefreshOutcome};
pub use scheduler::{InitReport, RefreshScheduler};
pub use subscription::SubscriptionRegistry;
