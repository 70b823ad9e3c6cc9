use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Describe every series the service records so the scrape output carries
/// help text from the first request on.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "analysis_jobs_submitted_total",
        "Total analysis jobs accepted by the API"
    );
    metrics::describe_counter!(
        "analysis_jobs_completed_total",
        "Total analysis jobs that reached completed"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Total analysis jobs that reached failed"
    );
    metrics::describe_histogram!(
        "analysis_job_processing_seconds",
        "Time from claim to terminal state for one job"
    );
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Pending jobs seen at the scheduler's last poll"
    );
    metrics::describe_counter!(
        "analysis_service_retries_total",
        "Backoff retries after transient analysis service errors"
    );
    metrics::describe_counter!(
        "analysis_recovery_stage_total",
        "Structured results recovered, by recovery stage"
    );
    metrics::describe_counter!(
        "webhook_deliveries_total",
        "Webhook deliveries by outcome"
    );
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
