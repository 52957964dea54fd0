//! aggex.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{
    DEFAULT_REFRESH_INTERVAL, MetricKind, MetricSpec, Namespace, Pipeline, RefreshPolicy,
};

/// URI used when the config leaves `backend.uri` empty.
pub const DEFAULT_BACKEND_URI: &str = "mongodb://localhost:27017";

/// Connection timeout used when the config leaves it unset.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    pub log_level: Option<String>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub metric_options: MetricOptions,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub uri: Option<String>,
    pub max_connections: Option<u32>,
    /// Seconds.
    pub connection_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricOptions {
    /// Seconds between refreshes for metrics without their own `cache_time`.
    /// Zero or negative counts as unset.
    pub default_cache_time: Option<i64>,
    pub default_database: Option<String>,
    pub default_collection: Option<String>,
}

/// A metric as written in the config file, before validation.
///
/// Every field is optional at the TOML level. An incomplete definition is
/// reported by [`MetricConfig::resolve`] for that metric alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub database: Option<String>,
    pub collection: Option<String>,
    #[serde(default)]
    pub pipeline: String,
    /// Seconds. Zero or negative counts as unset.
    pub cache_time: Option<i64>,
    #[serde(default)]
    pub realtime: bool,
}

impl ExporterConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate every configured metric independently.
    ///
    /// One bad definition does not affect the others; callers decide what
    /// to do with the failures.
    pub fn metric_specs(&self) -> Vec<ConfigResult<MetricSpec>> {
        self.metrics
            .iter()
            .map(|m| m.resolve(&self.metric_options))
            .collect()
    }
}

impl BackendConfig {
    pub fn uri(&self) -> &str {
        match self.uri.as_deref() {
            Some(uri) if !uri.trim().is_empty() => uri,
            _ => DEFAULT_BACKEND_URI,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        match self.connection_timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

impl MetricOptions {
    /// Interval for a metric: its own cache time, else the default cache
    /// time, else [`DEFAULT_REFRESH_INTERVAL`].
    pub fn refresh_interval(&self, cache_time: Option<i64>) -> Duration {
        [cache_time, self.default_cache_time]
            .into_iter()
            .flatten()
            .find_map(|secs| u64::try_from(secs).ok().filter(|secs| *secs > 0))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
    }
}

impl MetricConfig {
    /// Turn the raw definition into an immutable [`MetricSpec`].
    pub fn resolve(&self, options: &MetricOptions) -> ConfigResult<MetricSpec> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyField {
                metric: "<unnamed>".to_string(),
                field: "name",
            });
        }
        let empty = |field: &'static str| ConfigError::EmptyField {
            metric: name.to_string(),
            field,
        };

        let kind = self
            .kind
            .parse::<MetricKind>()
            .map_err(|kind| ConfigError::UnknownKind {
                metric: name.to_string(),
                kind,
            })?;

        if self.value.trim().is_empty() {
            return Err(empty("value"));
        }
        if self.labels.iter().any(|l| l.trim().is_empty()) {
            return Err(empty("labels"));
        }

        let database = fallback(&self.database, &options.default_database)
            .ok_or_else(|| empty("database"))?;
        let collection = fallback(&self.collection, &options.default_collection)
            .ok_or_else(|| empty("collection"))?;

        let pipeline =
            Pipeline::parse(&self.pipeline).map_err(|source| ConfigError::InvalidPipeline {
                metric: name.to_string(),
                source,
            })?;

        let refresh = if self.realtime {
            RefreshPolicy::Realtime
        } else {
            RefreshPolicy::Interval(options.refresh_interval(self.cache_time))
        };

        // The exposition format requires a non-empty help string.
        let help = if self.help.trim().is_empty() {
            name.to_string()
        } else {
            self.help.clone()
        };

        Ok(MetricSpec {
            name: name.to_string(),
            kind,
            help,
            value_field: self.value.clone(),
            label_fields: self.labels.clone(),
            namespace: Namespace::new(database, collection),
            pipeline,
            refresh,
        })
    }
}

fn fallback(value: &Option<String>, default: &Option<String>) -> Option<String> {
    [value, default]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
