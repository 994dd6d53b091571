// Dispatching claimed queue entries and recording their executions

use super::{run_functions, JobEngine};
use crate::errors::ValidationError;
use crate::models::{
    duration_seconds, ExecutionStatus, FunctionCallResult, Job, NewExecution, UpdateJobRequest,
};
use crate::queue::{DispatchHandler, StoredEntry};
use crate::telemetry;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

/// Result of a dispatch that ran to completion
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The functions ran; `job` is the definition they ran with
    Completed {
        job: Job,
        results: Vec<FunctionCallResult>,
    },
    /// The job was deleted after its entry was queued
    JobGone,
}

fn payload_job(entry: &StoredEntry) -> anyhow::Result<Job> {
    serde_json::from_value(entry.payload.clone())
        .with_context(|| format!("Queue entry {} does not carry a job", entry.id))
}

#[async_trait]
impl DispatchHandler for JobEngine {
    type Output = DispatchOutcome;

    #[instrument(skip_all, fields(entry_id = %entry.id))]
    async fn process(&self, entry: &StoredEntry) -> anyhow::Result<DispatchOutcome> {
        let queued = payload_job(entry)?;

        // The row may have changed since the entry was queued
        let Some(job) = self.store.find_job_by_id(queued.id).await? else {
            debug!(job_id = %queued.id, "Job no longer exists");
            return Ok(DispatchOutcome::JobGone);
        };

        let ids: Vec<String> = job.functions.iter().map(|f| f.function_id.clone()).collect();
        let missing = self.runner.invoker().missing_functions(&ids).await?;
        if !missing.is_empty() {
            return Err(ValidationError::FunctionsNotFound(missing.join(", ")).into());
        }

        let results = run_functions(&self.runner, &job.functions, job.execution_type).await;
        Ok(DispatchOutcome::Completed { job, results })
    }

    #[instrument(skip_all, fields(entry_id = %entry.id))]
    async fn on_completed(
        &self,
        entry: &StoredEntry,
        output: DispatchOutcome,
        finished_on: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let (job, results) = match output {
            DispatchOutcome::Completed { job, results } => (job, results),
            DispatchOutcome::JobGone => {
                let queued = payload_job(entry)?;
                let removed = self.dequeue(&queued).await?;
                info!(job_id = %queued.id, removed, "Dropped queue entry of deleted job");
                return Ok(());
            }
        };

        let status = ExecutionStatus::from_results(&results);
        let execution = NewExecution {
            job_id: job.id,
            processed_on: entry.processed_on,
            finished_on: Some(finished_on),
            results,
            functions: job.functions,
            execution_type: job.execution_type,
            status,
            schedule: job.schedule,
        };

        match self.store.create_execution(execution).await? {
            Some(saved) => {
                telemetry::record_execution(saved.status, saved.duration_seconds());
                info!(job_id = %job.id, execution_id = %saved.id, status = %saved.status, "Execution recorded");
            }
            None => warn!(job_id = %job.id, "Job deleted during dispatch, execution not recorded"),
        }
        Ok(())
    }

    #[instrument(skip_all, fields(entry_id = %entry.id))]
    async fn on_failed(
        &self,
        entry: &StoredEntry,
        error: &anyhow::Error,
        finished_on: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let job = payload_job(entry)?;

        let execution = NewExecution {
            job_id: job.id,
            processed_on: entry.processed_on,
            finished_on: Some(finished_on),
            results: Vec::new(),
            functions: job.functions.clone(),
            execution_type: job.execution_type,
            status: ExecutionStatus::JobError,
            schedule: job.schedule.clone(),
        };

        let Some(saved) = self.store.create_execution(execution).await? else {
            warn!(job_id = %job.id, "Job deleted before failure could be recorded");
            return Ok(());
        };
        telemetry::record_execution(
            ExecutionStatus::JobError,
            duration_seconds(saved.processed_on, saved.finished_on),
        );
        warn!(job_id = %job.id, execution_id = %saved.id, error = %error, "Job dispatch failed");

        self.disable_if_failing(&job).await
    }
}

impl JobEngine {
    /// Disable a job whose most recent executions all ended in JobError
    async fn disable_if_failing(&self, job: &Job) -> anyhow::Result<()> {
        let threshold = self.config.auto_disable_threshold;
        if threshold == 0 {
            return Ok(());
        }

        let recent = self.store.recent_executions(job.id, threshold).await?;
        let failing = recent.len() == threshold
            && recent.iter().all(|e| e.status == ExecutionStatus::JobError);
        if !failing {
            return Ok(());
        }

        let Some(current) = self.store.find_job_by_id(job.id).await? else {
            return Ok(());
        };
        if !current.is_enabled() {
            return Ok(());
        }

        let disable = UpdateJobRequest {
            enabled: Some(false),
            ..Default::default()
        };
        self.update_job(&current.environment_id, current.id, disable).await?;

        telemetry::record_auto_disabled(&current.id);
        if let Err(e) = self.alerts.send_alert(&current.id, &current.name, threshold).await {
            error!(job_id = %current.id, error = %e, "Failed to send auto-disable alert");
        }
        warn!(job_id = %current.id, consecutive_failures = threshold, "Job auto-disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::errors::InvocationError;
    use crate::invocation::{FunctionInvoker, FunctionRunner, InvocationResponse};
    use crate::models::{CreateJobRequest, ExecutionFilter, ExecutionType, FunctionInvocationRequest, JobStatus, Schedule};
    use crate::queue::{InMemoryWorkQueue, WorkQueue};
    use crate::store::{InMemoryJobStore, JobStore};
    use crate::telemetry::AlertNotifier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    /// Answers 200, or reports every function missing once `gone` is set
    #[derive(Default)]
    struct SwitchableInvoker {
        gone: AtomicBool,
    }

    #[async_trait]
    impl FunctionInvoker for SwitchableInvoker {
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

        async fn missing_functions(&self, ids: &[String]) -> Result<Vec<String>, InvocationError> {
            if self.gone.load(Ordering::SeqCst) {
                Ok(ids.to_vec())
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[derive(Default)]
    struct CountingAlerts(AtomicUsize);

    #[async_trait]
    impl AlertNotifier for CountingAlerts {
        async fn send_alert(&self, _: &Uuid, _: &str, _: usize) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        engine: JobEngine,
        store: InMemoryJobStore,
        queue: InMemoryWorkQueue,
        invoker: Arc<SwitchableInvoker>,
        alerts: Arc<CountingAlerts>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::new();
        let queue = InMemoryWorkQueue::default();
        let invoker = Arc::new(SwitchableInvoker::default());
        let alerts = Arc::new(CountingAlerts::default());
        let engine = JobEngine::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            FunctionRunner::new(invoker.clone()),
            alerts.clone(),
            EngineConfig::default(),
        );
        Fixture {
            engine,
            store,
            queue,
            invoker,
            alerts,
        }
    }

    async fn create(engine: &JobEngine) -> Job {
        let request = CreateJobRequest {
            name: "sync".to_string(),
            schedule: Schedule::Interval(5),
            functions: vec![FunctionInvocationRequest {
                function_id: "fn-1".to_string(),
                event_payload: None,
                headers_payload: None,
                params_payload: None,
            }],
            execution_type: ExecutionType::Sequential,
            enabled: None,
        };
        engine.create_job("env", request).await.unwrap()
    }

    fn entry_for(job: &Job) -> StoredEntry {
        let mut entry = StoredEntry::single(&job.queue_key(), Utc::now(), serde_json::to_value(job).unwrap());
        entry.processed_on = Some(Utc::now());
        entry
    }

    async fn dispatch(engine: &JobEngine, entry: &StoredEntry) {
        match engine.process(entry).await {
            Ok(output) => engine.on_completed(entry, output, Utc::now()).await.unwrap(),
            Err(e) => engine.on_failed(entry, &e, Utc::now()).await.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_successful_dispatch_records_finished_execution() {
        let f = fixture();
        let job = create(&f.engine).await;

        dispatch(&f.engine, &entry_for(&job)).await;

        let executions = f.store.list_executions(job.id, &ExecutionFilter::default()).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Finished);
        assert_eq!(executions[0].schedule, Schedule::Interval(5));
        assert!(executions[0].duration_seconds().is_some());
    }

    #[tokio::test]
    async fn test_dispatch_uses_reloaded_definition() {
        let f = fixture();
        let job = create(&f.engine).await;
        let entry = entry_for(&job);

        let rename = UpdateJobRequest {
            name: Some("renamed".to_string()),
            execution_type: Some(ExecutionType::Parallel),
            ..Default::default()
        };
        f.engine.update_job("env", job.id, rename).await.unwrap();

        match f.engine.process(&entry).await.unwrap() {
            DispatchOutcome::Completed { job, .. } => {
                assert_eq!(job.name, "renamed");
                assert_eq!(job.execution_type, ExecutionType::Parallel);
            }
            DispatchOutcome::JobGone => panic!("job still exists"),
        }
    }

    #[tokio::test]
    async fn test_deleted_job_writes_nothing_and_clears_entry() {
        let f = fixture();
        let job = create(&f.engine).await;
        let entry = entry_for(&job);
        f.store.delete_job(job.id).await.unwrap();

        let output = f.engine.process(&entry).await.unwrap();
        assert_eq!(output, DispatchOutcome::JobGone);
        f.engine.on_completed(&entry, output, Utc::now()).await.unwrap();

        assert!(f.queue.list_repeating().await.unwrap().is_empty());
        assert!(f.store.recent_executions(job.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_functions_record_job_error() {
        let f = fixture();
        let job = create(&f.engine).await;
        f.invoker.gone.store(true, Ordering::SeqCst);

        dispatch(&f.engine, &entry_for(&job)).await;

        let executions = f.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::JobError);
        assert!(executions[0].results.is_empty());
        assert_eq!(f.engine.get_job("env", job.id).await.unwrap().status, JobStatus::Enabled);
    }

    #[tokio::test]
    async fn test_three_job_errors_disable_the_job() {
        let f = fixture();
        let job = create(&f.engine).await;
        f.invoker.gone.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            dispatch(&f.engine, &entry_for(&job)).await;
        }

        let job = f.engine.get_job("env", job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Disabled);
        assert!(f.queue.list_repeating().await.unwrap().is_empty());
        assert_eq!(f.alerts.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_between_errors_resets_the_count() {
        let f = fixture();
        let job = create(&f.engine).await;

        f.invoker.gone.store(true, Ordering::SeqCst);
        dispatch(&f.engine, &entry_for(&job)).await;
        dispatch(&f.engine, &entry_for(&job)).await;
        f.invoker.gone.store(false, Ordering::SeqCst);
        dispatch(&f.engine, &entry_for(&job)).await;
        f.invoker.gone.store(true, Ordering::SeqCst);
        dispatch(&f.engine, &entry_for(&job)).await;

        let job = f.engine.get_job("env", job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Enabled);
        assert_eq!(f.alerts.0.load(Ordering::SeqCst), 0);
    }
}
