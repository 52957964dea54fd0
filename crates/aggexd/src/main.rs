//! aggexd: the aggregation exporter daemon.
//!
//! Loads metric definitions from a TOML file, connects to MongoDB and keeps
//! every metric refreshed, either on its interval or on change events.
//!
//! # Usage
//!
//! ```text
//! aggexd run --config /etc/aggex/aggex.toml
//! aggexd once --config aggex.toml > metrics.txt
//! ```

mod once;
mod serve;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_subscriber::EnvFilter;

use aggex_core::{ExporterConfig, MetricSpec};

/// Filter used when neither `RUST_LOG` nor the config sets one.
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser)]
#[command(name = "aggexd", about = "Aggregation pipeline metrics exporter")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep every metric refreshed until interrupted.
    Run {
        /// Path to the exporter config.
        #[arg(long, default_value = "aggex.toml")]
        config: PathBuf,
    },
    /// Refresh every metric once and print the text exposition.
    Once {
        /// Path to the exporter config.
        #[arg(long, default_value = "aggex.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            init_tracing(cli.log_format, config.log_level.as_deref())?;
            serve::run(config).await
        }
        Command::Once { config } => {
            let config = load_config(&config)?;
            init_tracing(cli.log_format, config.log_level.as_deref())?;
            once::run(config).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ExporterConfig> {
    ExporterConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

/// `RUST_LOG` wins over the configured level, which wins over the default.
fn log_filter(env: Option<String>, configured: Option<&str>) -> String {
    env.filter(|s| !s.trim().is_empty())
        .or_else(|| {
            configured
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

fn init_tracing(format: LogFormat, configured: Option<&str>) -> anyhow::Result<()> {
    let directives = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok(), configured);
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?}"))?;

    // Logs go to stderr so `once` output stays clean on stdout.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Resolve every metric definition, logging and dropping the invalid ones.
fn load_specs(config: &ExporterConfig) -> Vec<MetricSpec> {
    config
        .metric_specs()
        .into_iter()
        .filter_map(|result| match result {
            Ok(spec) => Some(spec),
            Err(e) => {
                error!(error = %e, "invalid metric definition, skipping");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::try_parse_from(["aggexd", "run"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Run { config } => assert_eq!(config, PathBuf::from("aggex.toml")),
            Command::Once { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn parses_once_with_json_logs() {
        let cli = Cli::try_parse_from([
            "aggexd",
            "once",
            "--config",
            "/etc/aggex.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Once { config } => assert_eq!(config, PathBuf::from("/etc/aggex.toml")),
            Command::Run { .. } => panic!("expected once"),
        }
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["aggexd", "run", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn log_filter_precedence() {
        assert_eq!(log_filter(Some("trace".into()), Some("warn")), "trace");
        assert_eq!(log_filter(None, Some("warn")), "warn");
        assert_eq!(log_filter(Some("  ".into()), Some("warn")), "warn");
        assert_eq!(log_filter(None, Some("")), DEFAULT_LOG_FILTER);
        assert_eq!(log_filter(None, None), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn invalid_metrics_are_dropped() {
        let config = ExporterConfig::parse(
            r#"
[[metrics]]
name = "ok"
type = "gauge"
value = "v"
database = "d"
collection = "c"
pipeline = "[]"

[[metrics]]
name = "bad"
type = "histogram"
value = "v"
database = "d"
collection = "c"
pipeline = "[]"
"#,
        )
        .unwrap();

        let specs = load_specs(&config);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "ok");
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Path::new("/nonexistent/aggex.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/aggex.toml"));
    }
}
