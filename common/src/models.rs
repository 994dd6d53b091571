use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Schedule Models
// ============================================================================

/// Schedule defines when a job fires.
///
/// Serialized as `{"type": "...", "value": ...}`, which is also the snapshot
/// format stored on every execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire every N minutes
    Interval(u32),
    /// Fire on a recurring cron expression
    Periodical(String),
    /// Fire once at the given instant
    OnTime(DateTime<Utc>),
}

impl Schedule {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Schedule::Interval(_) => ScheduleType::Interval,
            Schedule::Periodical(_) => ScheduleType::Periodical,
            Schedule::OnTime(_) => ScheduleType::OnTime,
        }
    }

    pub fn is_repeating(&self) -> bool {
        !matches!(self, Schedule::OnTime(_))
    }
}

/// Bare schedule discriminant, used for the `schedule_type` column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Periodical,
    OnTime,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleType::Interval => write!(f, "interval"),
            ScheduleType::Periodical => write!(f, "periodical"),
            ScheduleType::OnTime => write!(f, "on_time"),
        }
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(ScheduleType::Interval),
            "periodical" => Ok(ScheduleType::Periodical),
            "on_time" => Ok(ScheduleType::OnTime),
            _ => Err(format!("Invalid schedule type: {}", s)),
        }
    }
}

// ============================================================================
// Job Models
// ============================================================================

/// Job is a persisted schedule plus an ordered list of function calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub environment_id: String,
    pub name: String,
    pub schedule: Schedule,
    pub functions: Vec<FunctionInvocationSpec>,
    pub execution_type: ExecutionType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_enabled(&self) -> bool {
        self.status == JobStatus::Enabled
    }

    /// Key under which this job lives in the work queue
    pub fn queue_key(&self) -> String {
        self.id.to_string()
    }
}

/// One function call inside a job. Payloads are never null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionInvocationSpec {
    pub function_id: String,
    #[serde(default = "empty_object")]
    pub event_payload: serde_json::Value,
    #[serde(default = "empty_object")]
    pub headers_payload: serde_json::Value,
    #[serde(default = "empty_object")]
    pub params_payload: serde_json::Value,
}

impl FunctionInvocationSpec {
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            event_payload: empty_object(),
            headers_payload: empty_object(),
            params_payload: empty_object(),
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// How the functions of a job are run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Sequential,
    Parallel,
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionType::Sequential => write!(f, "sequential"),
            ExecutionType::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(ExecutionType::Sequential),
            "parallel" => Ok(ExecutionType::Parallel),
            _ => Err(format!("Invalid execution type: {}", s)),
        }
    }
}

/// JobStatus is orthogonal to the schedule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Enabled,
    Disabled,
}

impl From<bool> for JobStatus {
    fn from(enabled: bool) -> Self {
        if enabled {
            JobStatus::Enabled
        } else {
            JobStatus::Disabled
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Enabled => write!(f, "enabled"),
            JobStatus::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(JobStatus::Enabled),
            "disabled" => Ok(JobStatus::Disabled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Data needed to insert a new job row
#[derive(Debug, Clone)]
pub struct NewJob {
    pub environment_id: String,
    pub name: String,
    pub schedule: Schedule,
    pub functions: Vec<FunctionInvocationSpec>,
    pub execution_type: ExecutionType,
    pub status: JobStatus,
}

/// Partial update of a job; `None` leaves the column untouched
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    pub name: Option<String>,
    pub schedule: Option<Schedule>,
    pub functions: Option<Vec<FunctionInvocationSpec>>,
    pub execution_type: Option<ExecutionType>,
    pub status: Option<JobStatus>,
}

impl JobChanges {
    pub fn disable() -> Self {
        Self {
            status: Some(JobStatus::Disabled),
            ..Default::default()
        }
    }

    /// Returns the job as it looks after the changes are applied
    pub fn apply_to(&self, job: &Job) -> Job {
        let mut updated = job.clone();
        if let Some(name) = &self.name {
            updated.name = name.clone();
        }
        if let Some(schedule) = &self.schedule {
            updated.schedule = schedule.clone();
        }
        if let Some(functions) = &self.functions {
            updated.functions = functions.clone();
        }
        if let Some(execution_type) = self.execution_type {
            updated.execution_type = execution_type;
        }
        if let Some(status) = self.status {
            updated.status = status;
        }
        updated
    }
}

// ============================================================================
// Request Models
// ============================================================================

/// A function reference as received from callers; payloads may be omitted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionInvocationRequest {
    pub function_id: String,
    #[serde(default)]
    pub event_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub headers_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub params_payload: Option<serde_json::Value>,
}

impl FunctionInvocationRequest {
    /// Fill in absent (or null) payloads with empty objects
    pub fn into_spec(self) -> FunctionInvocationSpec {
        fn or_empty(value: Option<serde_json::Value>) -> serde_json::Value {
            match value {
                Some(serde_json::Value::Null) | None => empty_object(),
                Some(value) => value,
            }
        }

        FunctionInvocationSpec {
            function_id: self.function_id,
            event_payload: or_empty(self.event_payload),
            headers_payload: or_empty(self.headers_payload),
            params_payload: or_empty(self.params_payload),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub name: String,
    pub schedule: Schedule,
    pub functions: Vec<FunctionInvocationRequest>,
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub functions: Option<Vec<FunctionInvocationRequest>>,
    #[serde(default)]
    pub execution_type: Option<ExecutionType>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Caller-facing view of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub name: String,
    pub environment_id: String,
    pub schedule: Schedule,
    pub functions: Vec<FunctionInvocationSpec>,
    pub execution_type: ExecutionType,
    pub status: JobStatus,
    pub next_execution_at: Option<DateTime<Utc>>,
}

// ============================================================================
// JobExecution Models
// ============================================================================

/// Outcome of a single function call within a dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallResult {
    pub function_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub fatal_error: bool,
}

impl FunctionCallResult {
    pub fn completed(function_id: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            function_id: function_id.into(),
            status_code,
            fatal_error: false,
        }
    }

    /// A call that never completed (exception or timeout)
    pub fn fatal(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            status_code: None,
            fatal_error: true,
        }
    }

    /// Fatal, or completed outside [200, 300)
    pub fn is_failure(&self) -> bool {
        self.fatal_error || !crate::invocation::is_success_status(self.status_code)
    }
}

/// ExecutionStatus of a persisted dispatch attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Finished,
    JobError,
    WithCallError,
}

impl ExecutionStatus {
    /// Status for a dispatch that produced a result list
    pub fn from_results(results: &[FunctionCallResult]) -> Self {
        if results.iter().any(FunctionCallResult::is_failure) {
            ExecutionStatus::WithCallError
        } else {
            ExecutionStatus::Finished
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Finished => write!(f, "finished"),
            ExecutionStatus::JobError => write!(f, "job_error"),
            ExecutionStatus::WithCallError => write!(f, "with_call_error"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "finished" => Ok(ExecutionStatus::Finished),
            "job_error" => Ok(ExecutionStatus::JobError),
            "with_call_error" => Ok(ExecutionStatus::WithCallError),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// JobExecution is the immutable record of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub results: Vec<FunctionCallResult>,
    pub functions: Vec<FunctionInvocationSpec>,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    /// Schedule active at dispatch time, not the job's current one
    pub schedule: Schedule,
    pub created_at: DateTime<Utc>,
}

impl JobExecution {
    /// Duration in seconds, if both timestamps were recorded
    pub fn duration_seconds(&self) -> Option<f64> {
        duration_seconds(self.processed_on, self.finished_on)
    }

    pub fn to_view(&self) -> ExecutionView {
        ExecutionView {
            id: self.id,
            job_id: self.job_id,
            processed_on: self.processed_on,
            finished_on: self.finished_on,
            duration: self.duration_seconds(),
            results: self.results.clone(),
            functions: self.functions.clone(),
            execution_type: self.execution_type,
            status: self.status,
            schedule: self.schedule.clone(),
        }
    }
}

pub fn duration_seconds(
    processed_on: Option<DateTime<Utc>>,
    finished_on: Option<DateTime<Utc>>,
) -> Option<f64> {
    match (processed_on, finished_on) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
        _ => None,
    }
}

/// Data needed to insert an execution row
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub job_id: Uuid,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub results: Vec<FunctionCallResult>,
    pub functions: Vec<FunctionInvocationSpec>,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    pub schedule: Schedule,
}

/// Caller-facing view of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    pub id: Uuid,
    pub job_id: Uuid,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub results: Vec<FunctionCallResult>,
    pub functions: Vec<FunctionInvocationSpec>,
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    pub schedule: Schedule,
}

/// Filter for listing executions of a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &JobExecution) -> bool {
        self.status.map_or(true, |status| execution.status == status)
    }
}
