//! Dry run: refresh every metric one time and print what a scrape would see.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use aggex_backend::MongoBackend;
use aggex_core::ExporterConfig;
use aggex_metrics::Registry;
use aggex_scheduler::RefreshScheduler;

pub async fn run(config: ExporterConfig) -> anyhow::Result<()> {
    let specs = crate::load_specs(&config);
    let backend = MongoBackend::connect(&config.backend)
        .await
        .context("failed to connect to mongodb")?;

    let mut scheduler = RefreshScheduler::with_backend(specs, Arc::new(backend), Registry::new());
    let results = scheduler.refresh_all().await;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    info!(refreshed = results.len() - failed, failed, "dry run complete");

    let exposition =
        aggex_metrics::render(scheduler.registry()).context("failed to encode metrics")?;
    print!("{exposition}");

    if failed > 0 {
        anyhow::bail!("{failed} metric(s) failed to refresh");
    }
    Ok(())
}
