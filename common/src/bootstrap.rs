// Bootstrap utilities shared by the scheduler and worker binaries

use crate::config::Settings;
use crate::db::{DbPool, RedisPool};
use crate::engine::{EngineConfig, JobEngine};
use crate::invocation::{FunctionRunner, HttpFunctionInvoker};
use crate::queue::{RedisWorkQueue, WorkQueue, WorkerConfig};
use crate::store::PgJobStore;
use crate::telemetry::LogAlertNotifier;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Initialize the database pool and bring the schema up to date
///
/// # Errors
/// Returns error if the pool cannot connect or a migration fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;
    db_pool.migrate().await.context("Failed to run migrations")?;
    db_pool
        .health_check()
        .await
        .context("Database health check failed")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Initialize the Redis-backed work queue
#[tracing::instrument(skip(settings))]
pub async fn init_work_queue(settings: &Settings) -> Result<Arc<dyn WorkQueue>> {
    info!("Initializing work queue");

    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;
    redis_pool
        .health_check()
        .await
        .context("Redis health check failed")?;
    let queue = RedisWorkQueue::new(
        redis_pool,
        settings.queue.key_prefix.clone(),
        settings.queue.overlap_policy,
    )
    .with_claim_lease(settings.queue.claim_lease());

    info!(
        prefix = %settings.queue.key_prefix,
        overlap_policy = ?settings.queue.overlap_policy,
        claim_lease_secs = settings.queue.claim_lease_seconds,
        "Work queue initialized"
    );
    Ok(Arc::new(queue))
}

/// Build the job engine over PostgreSQL, the given queue and the HTTP invoker
#[tracing::instrument(skip_all)]
pub fn init_engine(settings: &Settings, db_pool: DbPool, queue: Arc<dyn WorkQueue>) -> Result<Arc<JobEngine>> {
    let invoker = HttpFunctionInvoker::new(
        settings.functions.base_url.clone(),
        settings.functions.timeout_seconds.map(Duration::from_secs),
    )
    .context("Failed to initialize function invoker")?;

    let engine = JobEngine::new(
        Arc::new(PgJobStore::new(db_pool)),
        queue,
        FunctionRunner::new(Arc::new(invoker)),
        Arc::new(LogAlertNotifier),
        EngineConfig::from(&settings.jobs),
    );

    info!(functions_url = %settings.functions.base_url, "Job engine initialized");
    Ok(Arc::new(engine))
}

/// Worker pool settings from configuration
pub fn worker_config(settings: &Settings) -> WorkerConfig {
    WorkerConfig {
        concurrency: settings.queue.concurrency,
        poll_interval: settings.queue.poll_interval(),
        lease_renew_interval: settings.queue.lease_renew_interval(),
    }
}
