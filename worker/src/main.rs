// Worker binary entry point: claims due queue entries and dispatches jobs

use anyhow::Result;
use common::bootstrap::{init_database_pool, init_engine, init_work_queue, worker_config};
use common::config::Settings;
use common::queue::QueueWorker;
use common::telemetry;
use std::sync::Arc;
use tokio::signal;
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

    info!("Starting function job worker");

    let db_pool = init_database_pool(&settings).await?;
    let queue = init_work_queue(&settings).await?;
    let engine = init_engine(&settings, db_pool.clone(), Arc::clone(&queue))?;

    let worker = Arc::new(QueueWorker::new(queue, engine, worker_config(&settings)));

    let running = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            if let Err(e) = worker.start().await {
                error!(error = %e, "Queue worker error");
            }
        })
    };

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    info!("Waiting for in-flight dispatches to complete");
    worker.stop();
    if let Err(e) = running.await {
        error!(error = %e, "Worker task panicked");
    }

    info!("Worker stopped");
    db_pool.close().await;
    telemetry::shutdown_tracer();
    Ok(())
}
