// In-memory job store for tests and single-process use

use super::{JobStore, JobStoreTx};
use crate::errors::DatabaseError;
use crate::models::{ExecutionFilter, Job, JobChanges, JobExecution, NewExecution, NewJob};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct StoreState {
    jobs: HashMap<Uuid, Job>,
    /// Insertion order
    executions: Vec<JobExecution>,
}

impl StoreState {
    fn insert_job(&mut self, job: NewJob) -> Job {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            environment_id: job.environment_id,
            name: job.name,
            schedule: job.schedule,
            functions: job.functions,
            execution_type: job.execution_type,
            status: job.status,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn update_job(&mut self, id: Uuid, changes: &JobChanges) -> Result<Job, DatabaseError> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("job {}", id)))?;
        let mut updated = changes.apply_to(job);
        updated.updated_at = Utc::now();
        *job = updated.clone();
        Ok(updated)
    }

    fn delete_job(&mut self, id: Uuid) -> bool {
        let removed = self.jobs.remove(&id).is_some();
        if removed {
            self.executions.retain(|e| e.job_id != id);
        }
        removed
    }

    fn newest_first(&self, job_id: Uuid) -> impl Iterator<Item = &JobExecution> {
        self.executions.iter().rev().filter(move |e| e.job_id == job_id)
    }
}

/// Job store backed by a mutex-guarded map.
///
/// Transactions hold the lock until they commit or are dropped, so callers
/// must not read through the store while a transaction is open.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<StoreState>>,
    fail_commits: Arc<AtomicBool>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail, to exercise compensation paths
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: NewJob) -> Result<Job, DatabaseError> {
        Ok(self.state.lock().await.insert_job(job))
    }

    async fn update_job(&self, id: Uuid, changes: JobChanges) -> Result<Job, DatabaseError> {
        self.state.lock().await.update_job(id, &changes)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        Ok(self.state.lock().await.delete_job(id))
    }

    async fn find_job(&self, environment_id: &str, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(&id)
            .filter(|job| job.environment_id == environment_id)
            .cloned())
    }

    async fn find_job_by_id(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, environment_id: &str) -> Result<Vec<Job>, DatabaseError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.environment_id == environment_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_enabled_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state.jobs.values().filter(|job| job.is_enabled()).cloned().collect())
    }

    async fn create_execution(
        &self,
        execution: NewExecution,
    ) -> Result<Option<JobExecution>, DatabaseError> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&execution.job_id) {
            return Ok(None);
        }

        let record = JobExecution {
            id: Uuid::new_v4(),
            job_id: execution.job_id,
            processed_on: execution.processed_on,
            finished_on: execution.finished_on,
            results: execution.results,
            functions: execution.functions,
            execution_type: execution.execution_type,
            status: execution.status,
            schedule: execution.schedule,
            created_at: Utc::now(),
        };
        state.executions.push(record.clone());
        Ok(Some(record))
    }

    async fn find_execution(
        &self,
        job_id: Uuid,
        id: Uuid,
    ) -> Result<Option<JobExecution>, DatabaseError> {
        let state = self.state.lock().await;
        let found = state.newest_first(job_id).find(|e| e.id == id).cloned();
        Ok(found)
    }

    async fn list_executions(
        &self,
        job_id: Uuid,
        filter: &ExecutionFilter,
    ) -> Result<Vec<JobExecution>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .newest_first(job_id)
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn recent_executions(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<JobExecution>, DatabaseError> {
        let state = self.state.lock().await;
        let mut executions: Vec<JobExecution> = state.newest_first(job_id).cloned().collect();
        // Stable sort keeps insertion order among equal timestamps; None sorts last
        executions.sort_by(|a, b| b.processed_on.cmp(&a.processed_on));
        executions.truncate(limit);
        Ok(executions)
    }

    async fn delete_executions(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock().await;
        let before = state.executions.len();
        state.executions.retain(|e| e.job_id != job_id);
        Ok((before - state.executions.len()) as u64)
    }

    async fn delete_execution(&self, job_id: Uuid, id: Uuid) -> Result<bool, DatabaseError> {
        let mut state = self.state.lock().await;
        let before = state.executions.len();
        state.executions.retain(|e| !(e.job_id == job_id && e.id == id));
        Ok(state.executions.len() != before)
    }

    async fn begin(&self) -> Result<Box<dyn JobStoreTx>, DatabaseError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryJobStoreTx {
            guard,
            working,
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        }))
    }
}

/// Transaction over a working copy; the copy replaces the state on commit
pub struct InMemoryJobStoreTx {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
    fail_commit: bool,
}

#[async_trait]
impl JobStoreTx for InMemoryJobStoreTx {
    async fn create_job(&mut self, job: NewJob) -> Result<Job, DatabaseError> {
        Ok(self.working.insert_job(job))
    }

    async fn update_job(&mut self, id: Uuid, changes: JobChanges) -> Result<Job, DatabaseError> {
        self.working.update_job(id, &changes)
    }

    async fn delete_job(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        Ok(self.working.delete_job(id))
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let InMemoryJobStoreTx {
            mut guard,
            working,
            fail_commit,
        } = *self;

        if fail_commit {
            return Err(DatabaseError::TransactionFailed(
                "commit rejected by in-memory store".to_string(),
            ));
        }
        *guard = working;
        Ok(())
    }
}
