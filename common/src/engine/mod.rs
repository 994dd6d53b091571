// Job scheduling engine
//
// Owns the job lifecycle: validation, persistence, keeping the work queue in
// step with the store, dispatch of queued jobs and recording their outcomes.

mod dispatch;
mod execution;
mod queueing;

pub use dispatch::DispatchOutcome;
pub use execution::run_functions;
pub use queueing::QueueChangePlan;

use crate::config::JobsConfig;
use crate::errors::{EngineError, ValidationError};
use crate::invocation::FunctionRunner;
use crate::models::{
    CreateJobRequest, ExecutionFilter, ExecutionView, FunctionInvocationRequest,
    FunctionInvocationSpec, Job, JobChanges, JobExecution, JobView, NewJob, UpdateJobRequest,
};
use crate::queue::WorkQueue;
use crate::schedule::{validate_schedule, SchedulePolicy, ValidationPurpose};
use crate::store::JobStore;
use crate::telemetry::AlertNotifier;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Engine policy knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub schedule_policy: SchedulePolicy,
    /// Consecutive JobError executions that disable a job
    pub auto_disable_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule_policy: SchedulePolicy::default(),
            auto_disable_threshold: 3,
        }
    }
}

impl From<&JobsConfig> for EngineConfig {
    fn from(config: &JobsConfig) -> Self {
        Self {
            schedule_policy: config.schedule_policy(),
            auto_disable_threshold: config.auto_disable_threshold,
        }
    }
}

/// The job scheduling engine
pub struct JobEngine {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    runner: FunctionRunner,
    alerts: Arc<dyn AlertNotifier>,
    config: EngineConfig,
}

impl JobEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        runner: FunctionRunner,
        alerts: Arc<dyn AlertNotifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            runner,
            alerts,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Create a job and enqueue it when enabled.
    ///
    /// The row is committed first; if enqueueing then fails the job is left
    /// for reconciliation to pick up.
    #[instrument(skip(self, request), fields(job_name = %request.name))]
    pub async fn create_job(
        &self,
        environment_id: &str,
        request: CreateJobRequest,
    ) -> Result<Job, EngineError> {
        let name = validate_name(&request.name)?;
        let functions = self.validate_functions(request.functions).await?;
        validate_schedule(
            &request.schedule,
            &self.config.schedule_policy,
            ValidationPurpose::Create,
            Utc::now(),
        )?;

        let job = self
            .store
            .create_job(NewJob {
                environment_id: environment_id.to_string(),
                name,
                schedule: request.schedule,
                functions,
                execution_type: request.execution_type,
                status: request.enabled.unwrap_or(true).into(),
            })
            .await?;

        if job.is_enabled() {
            if let Err(e) = self.enqueue(&job).await {
                error!(
                    job_id = %job.id,
                    error = %e,
                    "Failed to enqueue new job, leaving it to reconciliation"
                );
            }
        }

        info!(job_id = %job.id, status = %job.status, "Job created");
        Ok(job)
    }

    /// Apply a partial update, moving queue entries per `QueueChangePlan`
    #[instrument(skip(self, request), fields(job_id = %id))]
    pub async fn update_job(
        &self,
        environment_id: &str,
        id: Uuid,
        request: UpdateJobRequest,
    ) -> Result<Job, EngineError> {
        let old = self.get_job(environment_id, id).await?;

        let name = request.name.as_deref().map(validate_name).transpose()?;
        let functions = match request.functions {
            Some(functions) => Some(self.validate_functions(functions).await?),
            None => None,
        };
        if let Some(schedule) = &request.schedule {
            validate_schedule(
                schedule,
                &self.config.schedule_policy,
                ValidationPurpose::Update,
                Utc::now(),
            )?;
        }

        let changes = JobChanges {
            name,
            schedule: request.schedule,
            functions,
            execution_type: request.execution_type,
            status: request.enabled.map(Into::into),
        };

        let updated = self.apply_update(&old, changes).await?;
        info!(status = %updated.status, "Job updated");
        Ok(updated)
    }

    /// Delete a job row and its queue entry as one logical operation
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn delete_job(&self, environment_id: &str, id: Uuid) -> Result<(), EngineError> {
        let job = self.get_job(environment_id, id).await?;

        let mut tx = self.store.begin().await?;
        tx.delete_job(id).await?;

        // A failed removal drops the transaction, so the row is kept
        self.dequeue(&job).await?;

        if let Err(e) = tx.commit().await {
            error!(error = %e, "Delete failed after queue removal, restoring queue entry");
            if job.is_enabled() {
                if let Err(restore_err) = self.enqueue(&job).await {
                    error!(error = %restore_err, "Failed to restore queue entry");
                }
            }
            return Err(e.into());
        }

        info!("Job deleted");
        Ok(())
    }

    pub async fn get_job(&self, environment_id: &str, id: Uuid) -> Result<Job, EngineError> {
        self.store
            .find_job(environment_id, id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    pub async fn list_jobs(&self, environment_id: &str) -> Result<Vec<Job>, EngineError> {
        Ok(self.store.list_jobs(environment_id).await?)
    }

    /// Caller view of a job, including when it fires next
    pub async fn job_view(&self, job: &Job) -> Result<JobView, EngineError> {
        Ok(JobView {
            id: job.id,
            name: job.name.clone(),
            environment_id: job.environment_id.clone(),
            schedule: job.schedule.clone(),
            functions: job.functions.clone(),
            execution_type: job.execution_type,
            status: job.status,
            next_execution_at: self.next_execution_at(job).await?,
        })
    }

    pub async fn get_execution(
        &self,
        environment_id: &str,
        job_id: Uuid,
        id: Uuid,
    ) -> Result<JobExecution, EngineError> {
        self.get_job(environment_id, job_id).await?;
        self.store
            .find_execution(job_id, id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    pub async fn list_executions(
        &self,
        environment_id: &str,
        job_id: Uuid,
        filter: &ExecutionFilter,
    ) -> Result<Vec<JobExecution>, EngineError> {
        self.get_job(environment_id, job_id).await?;
        Ok(self.store.list_executions(job_id, filter).await?)
    }

    pub fn execution_view(&self, execution: &JobExecution) -> ExecutionView {
        execution.to_view()
    }

    /// Clear a job's execution history; returns the number of removed executions
    #[instrument(skip(self))]
    pub async fn delete_executions(&self, environment_id: &str, job_id: Uuid) -> Result<u64, EngineError> {
        self.get_job(environment_id, job_id).await?;
        let deleted = self.store.delete_executions(job_id).await?;
        info!(deleted, "Job executions deleted");
        Ok(deleted)
    }

    #[instrument(skip(self))]
    pub async fn delete_execution(
        &self,
        environment_id: &str,
        job_id: Uuid,
        id: Uuid,
    ) -> Result<(), EngineError> {
        self.get_job(environment_id, job_id).await?;
        if !self.store.delete_execution(job_id, id).await? {
            return Err(EngineError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Normalize payloads and make sure every function resolves
    async fn validate_functions(
        &self,
        functions: Vec<FunctionInvocationRequest>,
    ) -> Result<Vec<FunctionInvocationSpec>, EngineError> {
        if functions.is_empty() {
            return Err(ValidationError::MissingField("functions".to_string()).into());
        }

        let specs: Vec<FunctionInvocationSpec> = functions
            .into_iter()
            .map(FunctionInvocationRequest::into_spec)
            .collect();
        if let Some(spec) = specs.iter().find(|s| s.function_id.trim().is_empty()) {
            return Err(ValidationError::InvalidFieldValue {
                field: "functionId".to_string(),
                reason: format!("'{}' is not a function id", spec.function_id),
            }
            .into());
        }

        let ids: Vec<String> = specs.iter().map(|s| s.function_id.clone()).collect();
        let missing = self.runner.invoker().missing_functions(&ids).await?;
        if !missing.is_empty() {
            return Err(ValidationError::FunctionsNotFound(missing.join(", ")).into());
        }

        Ok(specs)
    }
}

fn validate_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    Ok(trimmed.to_string())
}
