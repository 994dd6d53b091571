// Job store: persistence of jobs and their execution history

pub mod memory;
pub mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

use crate::errors::DatabaseError;
use crate::models::{ExecutionFilter, Job, JobChanges, JobExecution, NewExecution, NewJob};
use async_trait::async_trait;
use uuid::Uuid;

/// Persistent record of jobs and executions.
///
/// Listings are newest first. `recent_executions` orders by `processed_on`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<Job, DatabaseError>;

    /// Fails with `DatabaseError::NotFound` when the job does not exist
    async fn update_job(&self, id: Uuid, changes: JobChanges) -> Result<Job, DatabaseError>;

    /// Returns whether a row was deleted
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn find_job(&self, environment_id: &str, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    async fn find_job_by_id(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    async fn list_jobs(&self, environment_id: &str) -> Result<Vec<Job>, DatabaseError>;

    async fn list_enabled_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Insert an execution if its job still exists; `None` otherwise
    async fn create_execution(
        &self,
        execution: NewExecution,
    ) -> Result<Option<JobExecution>, DatabaseError>;

    async fn find_execution(
        &self,
        job_id: Uuid,
        id: Uuid,
    ) -> Result<Option<JobExecution>, DatabaseError>;

    async fn list_executions(
        &self,
        job_id: Uuid,
        filter: &ExecutionFilter,
    ) -> Result<Vec<JobExecution>, DatabaseError>;

    async fn recent_executions(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<JobExecution>, DatabaseError>;

    /// Returns the number of deleted executions
    async fn delete_executions(&self, job_id: Uuid) -> Result<u64, DatabaseError>;

    async fn delete_execution(&self, job_id: Uuid, id: Uuid) -> Result<bool, DatabaseError>;

    /// Open a transaction over job mutations
    async fn begin(&self) -> Result<Box<dyn JobStoreTx>, DatabaseError>;
}

/// Job mutations inside one transaction.
///
/// Nothing is visible to other readers until `commit`; dropping the
/// transaction without committing rolls it back.
#[async_trait]
pub trait JobStoreTx: Send {
    async fn create_job(&mut self, job: NewJob) -> Result<Job, DatabaseError>;

    async fn update_job(&mut self, id: Uuid, changes: JobChanges) -> Result<Job, DatabaseError>;

    async fn delete_job(&mut self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;
}
