// Scheduler binary entry point: periodic reconciliation of jobs and queue

use anyhow::Result;
use common::bootstrap::{init_database_pool, init_engine, init_work_queue};
use common::config::Settings;
use common::reconcile::Reconciler;
use common::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!("Starting function job scheduler");

    let db_pool = init_database_pool(&settings).await?;
    let queue = init_work_queue(&settings).await?;
    let engine = init_engine(&settings, db_pool.clone(), queue)?;

    let reconciler = Arc::new(Reconciler::new(
        engine,
        Duration::from_secs(settings.jobs.reconciliation_interval_seconds),
    ));

    let reconciler_for_shutdown = Arc::clone(&reconciler);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        reconciler_for_shutdown.stop();
    });

    reconciler.start().await;

    info!("Scheduler stopped");
    db_pool.close().await;
    telemetry::shutdown_tracer();
    Ok(())
}
