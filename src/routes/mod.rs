pub mod auth;
pub mod error;
pub mod health;
pub mod metrics;
pub mod thumbnails;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Base64 inflates the 8 MiB reference image limit by a third; leave room for the rest of the body.
const BODY_LIMIT_BYTES: usize = 12 * 1024 * 1024;

/// Build the HTTP API.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/thumbnails",
            get(thumbnails::list_thumbnails).post(thumbnails::submit_thumbnail),
        )
        .route("/api/v1/thumbnails/{id}", get(thumbnails::get_thumbnail))
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
}
