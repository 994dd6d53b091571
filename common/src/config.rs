// Configuration management with layered configuration (file, env)

use crate::queue::{OverlapPolicy, DEFAULT_CLAIM_LEASE_SECS};
use crate::schedule::SchedulePolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub jobs: JobsConfig,
    pub functions: FunctionsConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Prefix for every key the work queue writes
    pub key_prefix: String,
    pub poll_interval_ms: u64,
    /// Simultaneous job dispatches across the worker
    pub concurrency: usize,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    /// A claim not renewed within this many seconds is handed out again
    #[serde(default = "default_claim_lease_seconds")]
    pub claim_lease_seconds: u64,
}

fn default_claim_lease_seconds() -> u64 {
    DEFAULT_CLAIM_LEASE_SECS
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_seconds)
    }

    /// Workers renew a lease three times per lease period
    pub fn lease_renew_interval(&self) -> Duration {
        (self.claim_lease() / 3).max(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub minimum_execution_interval_minutes: u32,
    pub reconciliation_interval_seconds: u64,
    /// Consecutive JobError executions before a job is disabled
    pub auto_disable_threshold: usize,
}

impl JobsConfig {
    pub fn schedule_policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            minimum_execution_interval_minutes: self.minimum_execution_interval_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionsConfig {
    /// Base URL of the function-execution service
    pub base_url: String,
    /// No timeout unless set; the function service enforces its own
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.queue.key_prefix.is_empty() {
            return Err("Queue key_prefix cannot be empty".to_string());
        }
        if self.queue.poll_interval_ms == 0 {
            return Err("Queue poll_interval_ms must be greater than 0".to_string());
        }
        if self.queue.concurrency == 0 {
            return Err("Queue concurrency must be greater than 0".to_string());
        }
        if self.queue.claim_lease_seconds < 3 {
            return Err("Queue claim_lease_seconds must be at least 3".to_string());
        }

        if self.jobs.minimum_execution_interval_minutes == 0 {
            return Err("Jobs minimum_execution_interval_minutes must be greater than 0".to_string());
        }
        if self.jobs.reconciliation_interval_seconds == 0 {
            return Err("Jobs reconciliation_interval_seconds must be greater than 0".to_string());
        }
        if self.jobs.auto_disable_threshold == 0 {
            return Err("Jobs auto_disable_threshold must be greater than 0".to_string());
        }

        if self.functions.base_url.is_empty() {
            return Err("Functions base_url cannot be empty".to_string());
        }
        if self.functions.timeout_seconds == Some(0) {
            return Err("Functions timeout_seconds must be greater than 0 when set".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/function_jobs".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            queue: QueueConfig {
                key_prefix: "jobs".to_string(),
                poll_interval_ms: 1000,
                concurrency: 4,
                overlap_policy: OverlapPolicy::Skip,
                claim_lease_seconds: DEFAULT_CLAIM_LEASE_SECS,
            },
            jobs: JobsConfig {
                minimum_execution_interval_minutes: 5,
                reconciliation_interval_seconds: 600,
                auto_disable_threshold: 3,
            },
            functions: FunctionsConfig {
                base_url: "http://localhost:3000".to_string(),
                timeout_seconds: None,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
