// Error handling framework for the job engine
//
// Each concern gets its own enum; EngineError is what callers of the engine see.

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Execution interval must be at least {minimum} minutes")]
    IntervalTooShort { minimum: u32 },

    #[error("Execution interval must be at most {maximum} minutes")]
    IntervalTooLong { maximum: u32 },

    #[error("Job will not be executed since the given date is in the past")]
    DateInPast,

    #[error("No next execution time available for {schedule_type} schedule")]
    NoNextExecution { schedule_type: String },
}

/// Validation errors raised synchronously at the engine boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Functions with ids {0} not found")]
    FunctionsNotFound(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Errors raised by the function-execution collaborator
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),

    #[error("Invalid function service URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Function id '{0}' cannot be addressed")]
    InvalidFunctionId(String),

    #[error("Function call to {function_id} failed: {reason}")]
    CallFailed { function_id: String, reason: String },

    #[error("Unexpected response for function {function_id}: {reason}")]
    InvalidResponse { function_id: String, reason: String },
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Queue command failed: {0}")]
    Command(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Invalid repeat specification: {0}")]
    InvalidRepeat(String),
}

/// Errors surfaced by the job engine to its callers
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),
}

impl From<ScheduleError> for EngineError {
    fn from(err: ScheduleError) -> Self {
        EngineError::Validation(ValidationError::Schedule(err))
    }
}

impl EngineError {
    /// True for errors a caller caused and can fix
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_) | EngineError::JobNotFound(_) | EngineError::ExecutionNotFound(_)
        )
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => DatabaseError::QueryFailed(db_err.message().to_string()),
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            QueueError::Connection(err.to_string())
        } else {
            QueueError::Command(err.to_string())
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SerializationFailed(err.to_string())
    }
}
