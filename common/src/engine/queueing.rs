// Keeping the work queue in step with job definitions

use super::JobEngine;
use crate::errors::{EngineError, QueueError};
use crate::models::{Job, JobChanges};
use crate::queue::EntryState;
use crate::schedule::{queue_plan, QueuePlan};
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

/// Queue operations implied by an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueChangePlan {
    pub remove_old: bool,
    pub add_new: bool,
}

impl QueueChangePlan {
    pub fn between(old: &Job, new: &Job) -> Self {
        match (old.is_enabled(), new.is_enabled()) {
            (true, true) => {
                let rescheduled = old.schedule != new.schedule;
                Self {
                    remove_old: rescheduled,
                    add_new: rescheduled,
                }
            }
            (true, false) => Self {
                remove_old: true,
                add_new: false,
            },
            (false, true) => Self {
                remove_old: false,
                add_new: true,
            },
            (false, false) => Self::default(),
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.remove_old && !self.add_new
    }
}

/// Steps of a plan that already took effect
#[derive(Debug, Default)]
struct PlanProgress {
    removed_old: bool,
    added_new: bool,
}

impl JobEngine {
    /// Put a job into the queue according to its schedule.
    ///
    /// An OnTime job whose instant has passed is left out without error.
    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_value(job)?;
        let key = job.queue_key();

        match queue_plan(&job.schedule, Utc::now()) {
            QueuePlan::Repeating(spec) => self.queue.add_repeating(&key, &spec, payload).await,
            QueuePlan::Delayed { delay_ms } => self.queue.add_delayed(&key, delay_ms, payload).await,
            QueuePlan::Expired => {
                debug!(job_id = %job.id, "OnTime job already past, not enqueued");
                Ok(())
            }
        }
    }

    /// Exact inverse of `enqueue`; returns whether an entry was removed
    pub async fn dequeue(&self, job: &Job) -> Result<bool, QueueError> {
        let key = job.queue_key();

        match queue_plan(&job.schedule, Utc::now()) {
            QueuePlan::Repeating(spec) => self.queue.remove_repeating(&key, &spec).await,
            QueuePlan::Delayed { .. } | QueuePlan::Expired => self.queue.remove_delayed(&key).await,
        }
    }

    /// Whether the queue holds an entry matching the job's current schedule
    pub async fn is_queued(&self, job: &Job) -> Result<bool, QueueError> {
        let key = job.queue_key();

        match queue_plan(&job.schedule, Utc::now()) {
            QueuePlan::Repeating(spec) => Ok(self
                .queue
                .list_repeating()
                .await?
                .iter()
                .any(|record| record.key == key && record.spec == spec)),
            QueuePlan::Delayed { .. } | QueuePlan::Expired => {
                Ok(self.queue.get_entry(&key).await?.is_some())
            }
        }
    }

    /// Next fire time recorded by the queue, if the job is queued
    pub async fn next_execution_at(&self, job: &Job) -> Result<Option<DateTime<Utc>>, EngineError> {
        let key = job.queue_key();

        let next = match queue_plan(&job.schedule, Utc::now()) {
            QueuePlan::Repeating(spec) => self
                .queue
                .list_repeating()
                .await?
                .into_iter()
                .find(|record| record.key == key && record.spec == spec)
                .and_then(|record| record.next),
            QueuePlan::Delayed { .. } | QueuePlan::Expired => self
                .queue
                .get_entry(&key)
                .await?
                .filter(|entry| entry.state != EntryState::Active)
                .map(|entry| entry.fire_at),
        };
        Ok(next)
    }

    /// Persist an update and move queue entries in one planned step
    pub(super) async fn apply_update(&self, old: &Job, changes: JobChanges) -> Result<Job, EngineError> {
        let plan = QueueChangePlan::between(old, &changes.apply_to(old));
        let mut progress = PlanProgress::default();
        if plan.is_noop() {
            debug!(job_id = %old.id, "Update leaves the queue untouched");
        }

        let mut tx = self.store.begin().await?;
        let updated = tx.update_job(old.id, changes).await?;

        let result = async {
            if plan.remove_old {
                let removed = self.dequeue(old).await?;
                if !removed {
                    warn!(job_id = %old.id, "No queue entry matched the previous schedule");
                }
                progress.removed_old = true;
            }
            if plan.add_new {
                self.enqueue(&updated).await?;
                progress.added_new = true;
            }
            Ok::<(), EngineError>(())
        }
        .await;

        let result = match result {
            Ok(()) => tx.commit().await.map_err(EngineError::from),
            Err(e) => {
                drop(tx);
                Err(e)
            }
        };

        if let Err(e) = result {
            error!(job_id = %old.id, error = %e, ?plan, "Job update failed");
            self.rollback_update(old, &updated, &progress).await;
            return Err(e);
        }

        debug!(job_id = %old.id, ?plan, "Queue updated for job");
        Ok(updated)
    }

    /// Undo the queue side of a failed update: drop any entry added for the
    /// new definition and restore the old one if it is missing
    async fn rollback_update(&self, old: &Job, new: &Job, progress: &PlanProgress) {
        debug!(
            job_id = %old.id,
            removed_old = progress.removed_old,
            added_new = progress.added_new,
            "Rolling back queue changes"
        );

        if progress.added_new {
            if let Err(e) = self.dequeue(new).await {
                error!(job_id = %new.id, error = %e, "Failed to remove entry added by failed update");
            }
        }

        if !old.is_enabled() {
            return;
        }
        match self.is_queued(old).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.enqueue(old).await {
                    error!(job_id = %old.id, error = %e, "Failed to restore previous queue entry");
                }
            }
            Err(e) => error!(job_id = %old.id, error = %e, "Failed to inspect queue during rollback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionType, FunctionInvocationSpec, JobStatus, Schedule};
    use uuid::Uuid;

    fn job(status: JobStatus, schedule: Schedule) -> Job {
        Job {
            id: Uuid::new_v4(),
            environment_id: "env".to_string(),
            name: "job".to_string(),
            schedule,
            functions: vec![FunctionInvocationSpec::new("fn")],
            execution_type: ExecutionType::Sequential,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_transition_table() {
        let five = Schedule::Interval(5);
        let hourly = Schedule::Periodical("0 * * * *".to_string());
        let on = JobStatus::Enabled;
        let off = JobStatus::Disabled;

        let cases = [
            (on, five.clone(), on, five.clone(), false, false),
            (on, five.clone(), on, hourly.clone(), true, true),
            (on, five.clone(), off, five.clone(), true, false),
            (on, five.clone(), off, hourly.clone(), true, false),
            (off, five.clone(), on, five.clone(), false, true),
            (off, five.clone(), on, hourly.clone(), false, true),
            (off, five.clone(), off, hourly.clone(), false, false),
        ];

        for (old_status, old_schedule, new_status, new_schedule, remove, add) in cases {
            let old = job(old_status, old_schedule);
            let mut new = old.clone();
            new.status = new_status;
            new.schedule = new_schedule;

            let plan = QueueChangePlan::between(&old, &new);
            assert_eq!(plan.remove_old, remove, "{:?} -> {:?}", old.status, new.status);
            assert_eq!(plan.add_new, add, "{:?} -> {:?}", old.status, new.status);
        }
    }

    #[test]
    fn test_noop_plan() {
        assert!(QueueChangePlan::default().is_noop());
        assert!(!QueueChangePlan {
            remove_old: true,
            add_new: false
        }
        .is_noop());
    }
}
