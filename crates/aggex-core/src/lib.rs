//! Shared types and configuration for the aggregation exporter.
//!
//! Holds the immutable metric definitions ([`MetricSpec`]), the generic
//! query result model ([`ResultRecord`], [`Scalar`]), change notifications
//! ([`ChangeEvent`]) and the TOML configuration that produces them.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackendConfig, ExporterConfig, MetricConfig, MetricOptions};
pub use error::{ConfigError, ConfigResult, PipelineError};
pub use types::*;
