//! Long-running mode: start every refresh task and wait for Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use aggex_backend::MongoBackend;
use aggex_core::ExporterConfig;
use aggex_metrics::Registry;
use aggex_scheduler::RefreshScheduler;

/// Keep every metric refreshed until Ctrl-C.
///
/// This mode does not serve scrapes. An embedder exposing the values must
/// serve `aggex_metrics::render(scheduler.registry())` with
/// `aggex_metrics::CONTENT_TYPE` from its own HTTP endpoint.
pub async fn run(config: ExporterConfig) -> anyhow::Result<()> {
    info!("aggex exporter starting");

    let specs = crate::load_specs(&config);
    let backend = MongoBackend::connect(&config.backend)
        .await
        .context("failed to connect to mongodb")?;

    let mut scheduler = RefreshScheduler::with_backend(specs, Arc::new(backend), Registry::new());
    let report = scheduler.start()?;
    if report.initialized.is_empty() && !report.failed.is_empty() {
        warn!(failed = report.failed.len(), "no metric could be initialized");
    }
    info!(
        metrics = report.initialized.len(),
        subscriptions = scheduler.subscriptions().len(),
        "exporter running"
    );

    // ── Shutdown signal ────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    scheduler.shutdown().await;
    info!("aggex exporter stopped");
    Ok(())
}
