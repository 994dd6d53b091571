// Bounded worker pool draining the work queue

use super::{StoredEntry, WorkQueue};
use crate::errors::QueueError;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the queue worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Simultaneous dispatches
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How often a running dispatch renews its claim lease
    pub lease_renew_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            lease_renew_interval: Duration::from_secs(super::DEFAULT_CLAIM_LEASE_SECS / 3),
        }
    }
}

/// Callbacks run for every claimed entry.
///
/// `process` runs first; its result goes to `on_completed`, its error to
/// `on_failed`. The entry carries the queue's `processed_on` timestamp.
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    type Output: Send;

    async fn process(&self, entry: &StoredEntry) -> anyhow::Result<Self::Output>;

    async fn on_completed(
        &self,
        entry: &StoredEntry,
        output: Self::Output,
        finished_on: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn on_failed(
        &self,
        entry: &StoredEntry,
        error: &anyhow::Error,
        finished_on: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Polls the queue and runs dispatches on at most `concurrency` tasks
pub struct QueueWorker<H> {
    queue: Arc<dyn WorkQueue>,
    handler: Arc<H>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<H> QueueWorker<H>
where
    H: DispatchHandler + 'static,
{
    pub fn new(queue: Arc<dyn WorkQueue>, handler: Arc<H>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        let permits = Arc::new(Semaphore::new(config.concurrency));

        Self {
            queue,
            handler,
            config,
            permits,
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run the polling loop until `stop` is called, then wait for in-flight dispatches
    #[instrument(skip(self), fields(concurrency = self.config.concurrency))]
    pub async fn start(&self) -> Result<(), QueueError> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting queue worker"
        );

        let mut poll_interval = interval(self.config.poll_interval);
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.poll_once().await {
                        Ok(count) if count > 0 => debug!(dispatched = count, "Dispatched due entries"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Error claiming due entries"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping queue worker");
                    break;
                }
            }
        }

        self.drain().await;
        info!("Queue worker stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Claim as many due entries as there are free permits and spawn their dispatches
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let available = self.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let entries = self.queue.claim_due(Utc::now(), available).await?;
        let count = entries.len();

        for entry in entries {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Worker semaphore closed");
                    break;
                }
            };
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let renew_every = self.config.lease_renew_interval;

            tokio::spawn(async move {
                run_dispatch(queue.as_ref(), handler.as_ref(), entry.entry, renew_every).await;
                drop(permit);
            });
        }

        match self.queue.len().await {
            Ok(size) => telemetry::update_queue_size(size),
            Err(e) => debug!(error = %e, "Failed to read queue size"),
        }

        Ok(count)
    }

    /// Wait until every in-flight dispatch has finished
    pub async fn drain(&self) {
        let total = self.config.concurrency as u32;
        match self.permits.acquire_many(total).await {
            Ok(permits) => drop(permits),
            Err(e) => warn!(error = %e, "Worker semaphore closed while draining"),
        }
    }
}

#[instrument(skip_all, fields(entry_id = %entry.id, key = %entry.key))]
async fn run_dispatch<H: DispatchHandler>(
    queue: &dyn WorkQueue,
    handler: &H,
    entry: StoredEntry,
    renew_every: Duration,
) {
    let dispatch = dispatch_entry(handler, &entry);
    tokio::pin!(dispatch);
    let mut renew = interval_at(Instant::now() + renew_every, renew_every);

    loop {
        tokio::select! {
            _ = &mut dispatch => break,
            _ = renew.tick() => match queue.renew_lease(&entry, Utc::now()).await {
                Ok(true) => debug!("Claim lease renewed"),
                Ok(false) => warn!("Claim lease lost, entry may be dispatched again"),
                Err(e) => warn!(error = %e, "Failed to renew claim lease"),
            },
        }
    }

    if let Err(e) = queue.finish(&entry).await {
        error!(error = %e, "Failed to release claimed entry");
    }
}

async fn dispatch_entry<H: DispatchHandler>(handler: &H, entry: &StoredEntry) {
    let result = handler.process(entry).await;
    let finished_on = Utc::now();

    match result {
        Ok(output) => {
            if let Err(e) = handler.on_completed(entry, output, finished_on).await {
                error!(error = %e, "Completion handler failed");
            }
        }
        Err(err) => {
            warn!(error = %err, "Dispatch failed");
            if let Err(e) = handler.on_failed(entry, &err, finished_on).await {
                error!(error = %e, "Failure handler failed");
            }
        }
    }
}
