// Shared fixtures for engine tests: in-memory store and queue plus a scripted invoker
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use common::engine::{EngineConfig, JobEngine};
use common::errors::InvocationError;
use common::invocation::{FunctionInvoker, FunctionRunner, InvocationResponse};
use common::models::{CreateJobRequest, ExecutionType, FunctionInvocationRequest, Job, Schedule};
use common::queue::{DispatchHandler, InMemoryWorkQueue, StoredEntry};
use common::store::InMemoryJobStore;
use common::telemetry::AlertNotifier;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Invoker driven by function ids:
/// - `throw...` fails to complete
/// - a numeric id answers with that status code
/// - anything else answers 200
///
/// Ids in `missing` are reported as unknown.
#[derive(Default)]
pub struct ScriptedInvoker {
    pub calls: Mutex<Vec<String>>,
    pub missing: Mutex<HashSet<String>>,
}

impl ScriptedInvoker {
    pub fn mark_missing(&self, function_id: &str) {
        self.missing.lock().unwrap().insert(function_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FunctionInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        function_id: &str,
        _: &serde_json::Value,
        _: &serde_json::Value,
        _: &serde_json::Value,
    ) -> Result<InvocationResponse, InvocationError> {
        self.calls.lock().unwrap().push(function_id.to_string());
        if function_id.starts_with("throw") {
            return Err(InvocationError::CallFailed {
                function_id: function_id.to_string(),
                reason: "function raised".to_string(),
            });
        }
        Ok(InvocationResponse {
            status_code: Some(function_id.parse().unwrap_or(200)),
        })
    }

    async fn missing_functions(&self, ids: &[String]) -> Result<Vec<String>, InvocationError> {
        let missing = self.missing.lock().unwrap();
        Ok(ids.iter().filter(|id| missing.contains(*id)).cloned().collect())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub sent: AtomicUsize,
}

#[async_trait]
impl AlertNotifier for RecordingAlerts {
    async fn send_alert(&self, _: &Uuid, _: &str, _: usize) -> anyhow::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<JobEngine>,
    pub store: InMemoryJobStore,
    pub queue: InMemoryWorkQueue,
    pub invoker: Arc<ScriptedInvoker>,
    pub alerts: Arc<RecordingAlerts>,
}

pub fn harness() -> Harness {
    let store = InMemoryJobStore::new();
    let queue = InMemoryWorkQueue::default();
    let invoker = Arc::new(ScriptedInvoker::default());
    let alerts = Arc::new(RecordingAlerts::default());

    let engine = JobEngine::new(
        Arc::new(store.clone()),
        Arc::new(queue.clone()),
        FunctionRunner::new(invoker.clone()),
        alerts.clone(),
        EngineConfig::default(),
    );

    Harness {
        engine: Arc::new(engine),
        store,
        queue,
        invoker,
        alerts,
    }
}

pub fn function(id: &str) -> FunctionInvocationRequest {
    FunctionInvocationRequest {
        function_id: id.to_string(),
        event_payload: None,
        headers_payload: None,
        params_payload: None,
    }
}

pub fn create_request(schedule: Schedule, functions: &[&str], execution_type: ExecutionType) -> CreateJobRequest {
    CreateJobRequest {
        name: "scheduled-job".to_string(),
        schedule,
        functions: functions.iter().map(|id| function(id)).collect(),
        execution_type,
        enabled: None,
    }
}

/// Run one dispatch of `job` the way the worker does, without going through the queue
pub async fn dispatch_job(engine: &JobEngine, job: &Job) {
    let mut entry = StoredEntry::single(&job.queue_key(), Utc::now(), serde_json::to_value(job).unwrap());
    entry.processed_on = Some(Utc::now());
    dispatch_entry(engine, &entry).await;
}

pub async fn dispatch_entry(engine: &JobEngine, entry: &StoredEntry) {
    match engine.process(entry).await {
        Ok(output) => engine.on_completed(entry, output, Utc::now()).await.unwrap(),
        Err(e) => engine.on_failed(entry, &e, Utc::now()).await.unwrap(),
    }
}
