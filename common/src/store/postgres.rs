// PostgreSQL job store
//
// Query helpers are generic over the executor so the pool and an open
// transaction share the same SQL.

use super::{JobStore, JobStoreTx};
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{
    ExecutionFilter, ExecutionStatus, ExecutionType, FunctionCallResult, FunctionInvocationSpec,
    Job, JobChanges, JobExecution, JobStatus, NewExecution, NewJob, Schedule, ScheduleType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Postgres, Row, Transaction};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, environment_id, name, schedule_type, interval_minutes, \
     cron_expression, execute_at, functions, execution_type, status, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, job_id, processed_on, finished_on, results, functions, \
     execution_type, status, schedule, created_at";

/// Job store backed by PostgreSQL
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn corrupt(table: &str, reason: impl Into<String>) -> DatabaseError {
    DatabaseError::CorruptRow {
        table: table.to_string(),
        reason: reason.into(),
    }
}

fn parse_column<T: FromStr<Err = String>>(row: &PgRow, table: &str, column: &str) -> Result<T, DatabaseError> {
    let raw: String = row.try_get(column)?;
    T::from_str(&raw).map_err(|reason| corrupt(table, reason))
}

fn json_column<T: DeserializeOwned>(row: &PgRow, table: &str, column: &str) -> Result<T, DatabaseError> {
    let value: serde_json::Value = row.try_get(column)?;
    serde_json::from_value(value).map_err(|e| corrupt(table, format!("{}: {}", column, e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, DatabaseError> {
    serde_json::to_value(value)
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to serialize column: {}", e)))
}

/// Split a schedule into its table columns
struct ScheduleColumns {
    schedule_type: String,
    interval_minutes: Option<i32>,
    cron_expression: Option<String>,
    execute_at: Option<DateTime<Utc>>,
}

impl ScheduleColumns {
    fn from_schedule(schedule: &Schedule) -> Result<Self, DatabaseError> {
        let mut columns = Self {
            schedule_type: schedule.schedule_type().to_string(),
            interval_minutes: None,
            cron_expression: None,
            execute_at: None,
        };
        match schedule {
            Schedule::Interval(minutes) => {
                let minutes = i32::try_from(*minutes).map_err(|_| {
                    DatabaseError::QueryFailed(format!("interval {} out of range", minutes))
                })?;
                columns.interval_minutes = Some(minutes);
            }
            Schedule::Periodical(expression) => columns.cron_expression = Some(expression.clone()),
            Schedule::OnTime(at) => columns.execute_at = Some(*at),
        }
        Ok(columns)
    }
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, DatabaseError> {
    let schedule_type: ScheduleType = parse_column(row, "jobs", "schedule_type")?;
    match schedule_type {
        ScheduleType::Interval => {
            let minutes: Option<i32> = row.try_get("interval_minutes")?;
            minutes
                .and_then(|m| u32::try_from(m).ok())
                .map(Schedule::Interval)
                .ok_or_else(|| corrupt("jobs", "interval job without a valid interval_minutes"))
        }
        ScheduleType::Periodical => {
            let expression: Option<String> = row.try_get("cron_expression")?;
            expression
                .map(Schedule::Periodical)
                .ok_or_else(|| corrupt("jobs", "periodical job without cron_expression"))
        }
        ScheduleType::OnTime => {
            let at: Option<DateTime<Utc>> = row.try_get("execute_at")?;
            at.map(Schedule::OnTime)
                .ok_or_else(|| corrupt("jobs", "on_time job without execute_at"))
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, DatabaseError> {
    Ok(Job {
        id: row.try_get("id")?,
        environment_id: row.try_get("environment_id")?,
        name: row.try_get("name")?,
        schedule: schedule_from_row(row)?,
        functions: json_column::<Vec<FunctionInvocationSpec>>(row, "jobs", "functions")?,
        execution_type: parse_column::<ExecutionType>(row, "jobs", "execution_type")?,
        status: parse_column::<JobStatus>(row, "jobs", "status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<JobExecution, DatabaseError> {
    Ok(JobExecution {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        processed_on: row.try_get("processed_on")?,
        finished_on: row.try_get("finished_on")?,
        results: json_column::<Vec<FunctionCallResult>>(row, "job_executions", "results")?,
        functions: json_column::<Vec<FunctionInvocationSpec>>(row, "job_executions", "functions")?,
        execution_type: parse_column::<ExecutionType>(row, "job_executions", "execution_type")?,
        status: parse_column::<ExecutionStatus>(row, "job_executions", "status")?,
        schedule: json_column::<Schedule>(row, "job_executions", "schedule")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_job<'e, E: PgExecutor<'e>>(executor: E, job: NewJob) -> Result<Job, DatabaseError> {
    let columns = ScheduleColumns::from_schedule(&job.schedule)?;
    let functions = to_json(&job.functions)?;

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO jobs (
            id, environment_id, name, schedule_type, interval_minutes,
            cron_expression, execute_at, functions, execution_type, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(&job.environment_id)
    .bind(&job.name)
    .bind(&columns.schedule_type)
    .bind(columns.interval_minutes)
    .bind(&columns.cron_expression)
    .bind(columns.execute_at)
    .bind(functions)
    .bind(job.execution_type.to_string())
    .bind(job.status.to_string())
    .fetch_one(executor)
    .await?;

    job_from_row(&row)
}

async fn update_job_row<'e, E: PgExecutor<'e>>(
    executor: E,
    id: Uuid,
    changes: &JobChanges,
) -> Result<Job, DatabaseError> {
    let schedule = changes
        .schedule
        .as_ref()
        .map(ScheduleColumns::from_schedule)
        .transpose()?;
    let functions = changes.functions.as_ref().map(to_json).transpose()?;

    // Schedule columns are replaced together, or not at all
    let row = sqlx::query(&format!(
        r#"
        UPDATE jobs SET
            name = COALESCE($2, name),
            schedule_type = COALESCE($3, schedule_type),
            interval_minutes = CASE WHEN $3::text IS NULL THEN interval_minutes ELSE $4 END,
            cron_expression = CASE WHEN $3::text IS NULL THEN cron_expression ELSE $5 END,
            execute_at = CASE WHEN $3::text IS NULL THEN execute_at ELSE $6 END,
            functions = COALESCE($7, functions),
            execution_type = COALESCE($8, execution_type),
            status = COALESCE($9, status),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(id)
    .bind(&changes.name)
    .bind(schedule.as_ref().map(|s| s.schedule_type.clone()))
    .bind(schedule.as_ref().and_then(|s| s.interval_minutes))
    .bind(schedule.as_ref().and_then(|s| s.cron_expression.clone()))
    .bind(schedule.as_ref().and_then(|s| s.execute_at))
    .bind(functions)
    .bind(changes.execution_type.map(|t| t.to_string()))
    .bind(changes.status.map(|s| s.to_string()))
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) => job_from_row(&row),
        None => Err(DatabaseError::NotFound(format!("job {}", id))),
    }
}

async fn delete_job_row<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<bool, DatabaseError> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_name = %job.name))]
    async fn create_job(&self, job: NewJob) -> Result<Job, DatabaseError> {
        let job = insert_job(self.pool.pool(), job).await?;
        tracing::info!(job_id = %job.id, job_name = %job.name, "Job created");
        Ok(job)
    }

    #[instrument(skip(self, changes))]
    async fn update_job(&self, id: Uuid, changes: JobChanges) -> Result<Job, DatabaseError> {
        update_job_row(self.pool.pool(), id, &changes).await
    }

    #[instrument(skip(self))]
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        delete_job_row(self.pool.pool(), id).await
    }

    #[instrument(skip(self))]
    async fn find_job(&self, environment_id: &str, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE id = $1 AND environment_id = $2",
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(environment_id)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_job_by_id(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_jobs(&self, environment_id: &str) -> Result<Vec<Job>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE environment_id = $1 ORDER BY created_at DESC",
            JOB_COLUMNS
        ))
        .bind(environment_id)
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_enabled_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let rows = sqlx::query(&format!("SELECT {} FROM jobs WHERE status = $1", JOB_COLUMNS))
            .bind(JobStatus::Enabled.to_string())
            .fetch_all(self.pool.pool())
            .await?;

        let jobs: Vec<Job> = rows.iter().map(job_from_row).collect::<Result<_, _>>()?;
        tracing::debug!(count = jobs.len(), "Loaded enabled jobs");
        Ok(jobs)
    }

    #[instrument(skip(self, execution), fields(job_id = %execution.job_id, status = %execution.status))]
    async fn create_execution(
        &self,
        execution: NewExecution,
    ) -> Result<Option<JobExecution>, DatabaseError> {
        // Selecting from jobs makes the insert a no-op once the job is gone
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_executions (
                id, job_id, processed_on, finished_on, results, functions,
                execution_type, status, schedule
            )
            SELECT $1, jobs.id, $3, $4, $5, $6, $7, $8, $9
            FROM jobs WHERE jobs.id = $2
            RETURNING {}
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(execution.job_id)
        .bind(execution.processed_on)
        .bind(execution.finished_on)
        .bind(to_json(&execution.results)?)
        .bind(to_json(&execution.functions)?)
        .bind(execution.execution_type.to_string())
        .bind(execution.status.to_string())
        .bind(to_json(&execution.schedule)?)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_execution(
        &self,
        job_id: Uuid,
        id: Uuid,
    ) -> Result<Option<JobExecution>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM job_executions WHERE id = $1 AND job_id = $2",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .bind(job_id)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        job_id: Uuid,
        filter: &ExecutionFilter,
    ) -> Result<Vec<JobExecution>, DatabaseError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM job_executions
            WHERE job_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(job_id)
        .bind(filter.status.map(|s| s.to_string()))
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn recent_executions(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<JobExecution>, DatabaseError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM job_executions
            WHERE job_id = $1
            ORDER BY processed_on DESC NULLS LAST, created_at DESC
            LIMIT $2
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(job_id)
        .bind(limit as i64)
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn delete_executions(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_executions WHERE job_id = $1")
            .bind(job_id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_execution(&self, job_id: Uuid, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_executions WHERE id = $1 AND job_id = $2")
            .bind(id)
            .bind(job_id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin(&self) -> Result<Box<dyn JobStoreTx>, DatabaseError> {
        let tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
        Ok(Box::new(PgJobStoreTx { tx }))
    }
}

/// Open Postgres transaction; sqlx rolls it back on drop
pub struct PgJobStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl JobStoreTx for PgJobStoreTx {
    async fn create_job(&mut self, job: NewJob) -> Result<Job, DatabaseError> {
        insert_job(&mut *self.tx, job).await
    }

    async fn update_job(&mut self, id: Uuid, changes: JobChanges) -> Result<Job, DatabaseError> {
        update_job_row(&mut *self.tx, id, &changes).await
    }

    async fn delete_job(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        delete_job_row(&mut *self.tx, id).await
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx
            .commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))
    }
}
