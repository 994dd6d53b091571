// Reconciliation: re-enqueue enabled jobs that lost their queue entry

use crate::engine::JobEngine;
use crate::errors::EngineError;
use crate::queue::EntryState;
use crate::schedule::{queue_plan, QueuePlan};
use crate::telemetry;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

/// Counts of jobs restored by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub repeating_restored: usize,
    pub single_restored: usize,
    /// Expired claims returned to pending
    pub stalled_recovered: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.repeating_restored + self.single_restored
    }
}

/// Periodically compares enabled jobs with the work queue
pub struct Reconciler {
    engine: Arc<JobEngine>,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl Reconciler {
    pub fn new(engine: Arc<JobEngine>, interval: Duration) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        Self {
            engine,
            interval,
            shutdown_tx,
        }
    }

    /// Run passes until `stop` is called. The first pass runs immediately.
    #[instrument(skip(self), fields(interval_secs = self.interval.as_secs()))]
    pub async fn start(&self) {
        info!("Starting reconciliation loop");

        let mut ticker = interval(self.interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if report.total() > 0 || report.stalled_recovered > 0 => info!(
                            repeating = report.repeating_restored,
                            single = report.single_restored,
                            stalled = report.stalled_recovered,
                            "Restored orphaned jobs"
                        ),
                        Ok(_) => debug!("Queue in step with enabled jobs"),
                        Err(e) => error!(error = %e, "Reconciliation pass failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping reconciliation");
                    break;
                }
            }
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// One pass: expired claims go back to pending, then every enabled job
    /// whose current schedule has no live queue entry is enqueued again.
    ///
    /// A repeat record counts as live only while its current instance is
    /// still stored or a claim for its key is held.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, EngineError> {
        let queue = self.engine.queue();
        let stalled_recovered = queue.recover_stalled(Utc::now()).await?;
        let jobs = self.engine.store().list_enabled_jobs().await?;

        let entries = queue.list_entries(&EntryState::ALL).await?;
        let entry_ids: HashSet<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();
        let active_keys: HashSet<&str> = entries
            .iter()
            .filter(|entry| entry.state == EntryState::Active)
            .map(|entry| entry.key.as_str())
            .collect();
        let single: HashSet<&str> = entries.iter().map(|entry| entry.key.as_str()).collect();

        let repeating: HashSet<(String, String)> = queue
            .list_repeating()
            .await?
            .into_iter()
            .filter(|record| match record.current_instance() {
                Some(instance) => {
                    entry_ids.contains(instance.id.as_str()) || active_keys.contains(record.key.as_str())
                }
                None => true,
            })
            .map(|record| (record.key, record.spec.id()))
            .collect();

        let now = Utc::now();
        let mut report = ReconcileReport {
            stalled_recovered,
            ..ReconcileReport::default()
        };

        for job in jobs {
            let key = job.queue_key();
            let restored = match queue_plan(&job.schedule, now) {
                QueuePlan::Repeating(spec) => {
                    if repeating.contains(&(key, spec.id())) {
                        continue;
                    }
                    &mut report.repeating_restored
                }
                QueuePlan::Delayed { .. } => {
                    if single.contains(key.as_str()) {
                        continue;
                    }
                    &mut report.single_restored
                }
                QueuePlan::Expired => continue,
            };

            match self.engine.enqueue(&job).await {
                Ok(()) => {
                    *restored += 1;
                    debug!(job_id = %job.id, "Re-enqueued orphaned job");
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to re-enqueue job"),
            }
        }

        telemetry::record_orphans_restored("repeating", report.repeating_restored);
        telemetry::record_orphans_restored("single", report.single_restored);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::errors::InvocationError;
    use crate::invocation::{FunctionInvoker, FunctionRunner, InvocationResponse};
    use crate::models::{ExecutionType, FunctionInvocationSpec, JobStatus, NewJob, Schedule};
    use crate::queue::{InMemoryWorkQueue, WorkQueue};
    use crate::store::{InMemoryJobStore, JobStore};
    use crate::telemetry::LogAlertNotifier;
    use async_trait::async_trait;

    struct NoopInvoker;

    #[async_trait]
    impl FunctionInvoker for NoopInvoker {
        async fn invoke(
            &self,
            _: &str,
            _: &serde_json::Value,
            _: &serde_json::Value,
            _: &serde_json::Value,
        ) -> Result<InvocationResponse, InvocationError> {
            Ok(InvocationResponse {
                status_code: Some(200),
            })
        }
    }

    fn setup() -> (Reconciler, InMemoryJobStore, InMemoryWorkQueue) {
        setup_with_queue(InMemoryWorkQueue::default())
    }

    fn setup_with_queue(queue: InMemoryWorkQueue) -> (Reconciler, InMemoryJobStore, InMemoryWorkQueue) {
        let store = InMemoryJobStore::new();
        let engine = JobEngine::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            FunctionRunner::new(Arc::new(NoopInvoker)),
            Arc::new(LogAlertNotifier),
            EngineConfig::default(),
        );
        (
            Reconciler::new(Arc::new(engine), Duration::from_secs(600)),
            store,
            queue,
        )
    }

    fn new_job(schedule: Schedule, status: JobStatus) -> NewJob {
        NewJob {
            environment_id: "env".to_string(),
            name: "orphan".to_string(),
            schedule,
            functions: vec![FunctionInvocationSpec::new("fn-1")],
            execution_type: ExecutionType::Sequential,
            status,
        }
    }

    #[tokio::test]
    async fn test_restores_jobs_written_behind_the_engine() {
        let (reconciler, store, queue) = setup();
        store
            .create_job(new_job(Schedule::Interval(5), JobStatus::Enabled))
            .await
            .unwrap();
        store
            .create_job(new_job(
                Schedule::OnTime(Utc::now() + chrono::Duration::hours(1)),
                JobStatus::Enabled,
            ))
            .await
            .unwrap();
        store
            .create_job(new_job(Schedule::Interval(10), JobStatus::Disabled))
            .await
            .unwrap();

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                repeating_restored: 1,
                single_restored: 1,
                stalled_recovered: 0,
            }
        );
        assert_eq!(queue.list_repeating().await.unwrap().len(), 1);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_pass_is_a_noop() {
        let (reconciler, store, queue) = setup();
        store
            .create_job(new_job(Schedule::Periodical("*/15 * * * *".to_string()), JobStatus::Enabled))
            .await
            .unwrap();

        assert_eq!(reconciler.reconcile_once().await.unwrap().total(), 1);
        let before = queue.list_repeating().await.unwrap();

        assert_eq!(reconciler.reconcile_once().await.unwrap().total(), 0);
        assert_eq!(queue.list_repeating().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_past_on_time_job_is_not_restored() {
        let (reconciler, store, queue) = setup();
        store
            .create_job(new_job(
                Schedule::OnTime(Utc::now() - chrono::Duration::minutes(1)),
                JobStatus::Enabled,
            ))
            .await
            .unwrap();

        assert_eq!(reconciler.reconcile_once().await.unwrap().total(), 0);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_repeat_spec_does_not_count_as_queued() {
        let (reconciler, store, queue) = setup();
        let job = store
            .create_job(new_job(Schedule::Interval(5), JobStatus::Enabled))
            .await
            .unwrap();
        let stale = crate::schedule::RepeatSpec::Every { millis: 600_000 };
        queue
            .add_repeating(&job.queue_key(), &stale, serde_json::to_value(&job).unwrap())
            .await
            .unwrap();

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.repeating_restored, 1);
        assert_eq!(queue.list_repeating().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_claim_is_returned_to_pending() {
        let queue = InMemoryWorkQueue::default().with_claim_lease(Duration::from_millis(20));
        let (reconciler, store, queue) = setup_with_queue(queue);
        store
            .create_job(new_job(
                Schedule::OnTime(Utc::now() + chrono::Duration::milliseconds(30)),
                JobStatus::Enabled,
            ))
            .await
            .unwrap();
        assert_eq!(reconciler.reconcile_once().await.unwrap().single_restored, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let claimed = queue.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // the worker holding the claim never finishes it
        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.stalled_recovered, 1);
        assert_eq!(report.total(), 0);

        let again = queue.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, claimed[0].id);
    }
}
