use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the pipeline metrics. Called by both binaries.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "thumbnail_jobs_submitted_total",
        "Thumbnail requests admitted and queued"
    );
    metrics::describe_counter!(
        "thumbnail_jobs_completed_total",
        "Thumbnail jobs that completed"
    );
    metrics::describe_counter!(
        "thumbnail_jobs_failed_total",
        "Thumbnail jobs that failed terminally"
    );
    metrics::describe_counter!(
        "thumbnail_jobs_retried_total",
        "Failed attempts scheduled for retry"
    );
    metrics::describe_counter!(
        "thumbnail_credits_debited_total",
        "Credits debited for completed thumbnails"
    );
    metrics::describe_histogram!(
        "thumbnail_generation_seconds",
        "Time from claim to committed result for a thumbnail job"
    );
    metrics::describe_gauge!(
        "thumbnail_queue_depth",
        "Jobs waiting to be claimed, including scheduled retries"
    );
}

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
