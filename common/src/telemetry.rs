// Telemetry module for structured logging, metrics, and tracing

use crate::models::ExecutionStatus;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const SERVICE_NAME: &str = "function-job-engine";

/// Initialize structured logging with JSON formatting and trace context
///
/// Sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Trace context (trace_id, span_id) in all log entries
/// - Log levels from configuration or `RUST_LOG`
/// - Optional OpenTelemetry export when an endpoint is given
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize the Prometheus exporter and describe the engine's metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "job_execution_total",
        "Total number of persisted job executions by status"
    );
    describe_histogram!(
        "job_execution_duration_seconds",
        "Duration of job dispatches in seconds"
    );
    describe_counter!(
        "job_auto_disabled_total",
        "Jobs disabled after consecutive dispatch failures"
    );
    describe_counter!(
        "orphan_jobs_restored_total",
        "Jobs re-enqueued by reconciliation"
    );
    describe_gauge!("job_queue_size", "Current number of entries in the work queue");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Record a persisted execution
#[inline]
pub fn record_execution(status: ExecutionStatus, duration_seconds: Option<f64>) {
    counter!("job_execution_total", "status" => status.to_string()).increment(1);
    if let Some(duration) = duration_seconds {
        histogram!("job_execution_duration_seconds", "status" => status.to_string())
            .record(duration);
    }
}

#[inline]
pub fn record_auto_disabled(job_id: &Uuid) {
    counter!("job_auto_disabled_total", "job_id" => job_id.to_string()).increment(1);
}

/// Record jobs restored by reconciliation; `kind` is "repeating" or "single"
#[inline]
pub fn record_orphans_restored(kind: &'static str, count: usize) {
    counter!("orphan_jobs_restored_total", "kind" => kind).increment(count as u64);
}

#[inline]
pub fn update_queue_size(size: usize) {
    gauge!("job_queue_size").set(size as f64);
}

/// Alert notification interface for jobs disabled by repeated failures
#[async_trait::async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(
        &self,
        job_id: &Uuid,
        job_name: &str,
        consecutive_failures: usize,
    ) -> Result<()>;
}

/// Log-based alert notifier (default implementation)
///
/// Logs alerts at ERROR level; swap in a paging or chat integration where one exists.
pub struct LogAlertNotifier;

#[async_trait::async_trait]
impl AlertNotifier for LogAlertNotifier {
    #[tracing::instrument(skip(self))]
    async fn send_alert(
        &self,
        job_id: &Uuid,
        job_name: &str,
        consecutive_failures: usize,
    ) -> Result<()> {
        tracing::error!(
            job_id = %job_id,
            job_name = job_name,
            consecutive_failures = consecutive_failures,
            alert_type = "auto_disabled",
            "ALERT: Job disabled after {} consecutive failures",
            consecutive_failures
        );
        Ok(())
    }
}
