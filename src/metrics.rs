use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all controller metrics
const PREFIX: &str = "repo_jobs";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Claim protocol
    pub static ref JOB_CLAIMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_claims_total"), "Jobs claimed by this process"),
        &["kind"]
    ).expect("Failed to create claims_total metric");

    pub static ref JOB_COMPLETIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_completions_total"), "Jobs finished, by final state"),
        &["kind", "state"]
    ).expect("Failed to create completions_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_duration_seconds"),
            "Time from claim to finalization"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1200.0]),
        &["kind"]
    ).expect("Failed to create duration_seconds metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_running"),
        "Jobs currently executing in this process"
    ).expect("Failed to create running metric");

    pub static ref LEASE_RENEWALS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_lease_renewals_total"), "Lease renewal attempts"),
        &["result"]
    ).expect("Failed to create lease_renewals_total metric");

    pub static ref JOBS_ABANDONED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_abandoned_total"),
        "Jobs failed by the abandoned job cleanup"
    ).expect("Failed to create abandoned_total metric");

    // History
    pub static ref HISTORY_WRITE_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_history_write_failures_total"),
        "History records that could not be written"
    ).expect("Failed to create history_write_failures_total metric");

    pub static ref HISTORY_DELETIONS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_history_deletions_total"),
        "History records removed by retention"
    ).expect("Failed to create history_deletions_total metric");

    // Background jobs
    pub static ref BACKGROUND_JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_background_job_running"), "Whether a background job is executing"),
        &["job_id"]
    ).expect("Failed to create background_job_running metric");

    pub static ref BACKGROUND_JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_background_job_executions_total"), "Background job executions"),
        &["job_id", "status"]
    ).expect("Failed to create background_job_executions_total metric");

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_background_job_duration_seconds"),
            "Background job execution time"
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["job_id"]
    ).expect("Failed to create background_job_duration_seconds metric");
}

/// Register every metric. Safe to call more than once.
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOB_CLAIMS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_COMPLETIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(LEASE_RENEWALS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_ABANDONED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HISTORY_WRITE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HISTORY_DELETIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_DURATION_SECONDS.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_claimed(kind: &str) {
    JOB_CLAIMS_TOTAL.with_label_values(&[kind]).inc();
    JOBS_RUNNING.inc();
}

/// Record the end of an execution this process claimed, whatever its outcome.
pub fn record_job_finished(kind: &str, state: &str, duration: Duration) {
    JOB_COMPLETIONS_TOTAL
        .with_label_values(&[kind, state])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
    JOBS_RUNNING.dec();
}

pub fn record_lease_renewal(result: &str) {
    LEASE_RENEWALS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_job_abandoned() {
    JOBS_ABANDONED_TOTAL.inc();
}

pub fn record_history_write_failure() {
    HISTORY_WRITE_FAILURES_TOTAL.inc();
}

pub fn record_history_deletions(count: usize) {
    HISTORY_DELETIONS_TOTAL.inc_by(count as f64);
}

pub fn set_background_job_running(job_id: &str, running: bool) {
    BACKGROUND_JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_background_job_execution(job_id: &str, status: &str, duration: Duration) {
    BACKGROUND_JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_id, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` on `port` until `shutdown` resolves.
pub async fn run_metrics_server(
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Serving metrics on port {}", port);
    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_metric(name: &str) -> bool {
        REGISTRY.gather().iter().any(|m| m.get_name() == name)
    }

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        init_metrics();
        assert!(!REGISTRY.gather().is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_job_lifecycle_metrics() {
        init_metrics();

        record_job_claimed("sync");
        record_job_finished("sync", "succeeded", Duration::from_millis(250));
        record_lease_renewal("renewed");

        assert!(has_metric("repo_jobs_claims_total"));
        assert!(has_metric("repo_jobs_completions_total"));
        assert!(has_metric("repo_jobs_lease_renewals_total"));
    }

    #[test]
    fn test_background_job_metrics() {
        init_metrics();

        set_background_job_running("history_retention", true);
        record_background_job_execution("history_retention", "success", Duration::from_millis(5));
        set_background_job_running("history_retention", false);

        assert!(has_metric("repo_jobs_background_job_executions_total"));
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_text() {
        init_metrics();
        record_history_deletions(3);

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
