use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use thumbgen::app_state::AppState;
use thumbgen::config::AppConfig;
use thumbgen::db;
use thumbgen::routes::{self, auth::JwtVerifier};
use thumbgen::services::{encryption::EncryptionService, queue::RedisJobQueue};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing thumbgen API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Reference images are sealed before they are written to Redis
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");

    tracing::info!("Connecting to Redis job queue");
    let queue = RedisJobQueue::new(&config.redis_url, Arc::new(encryption), config.retry_policy())
        .expect("Failed to initialize job queue");

    let state = AppState::new(db_pool, queue, JwtVerifier::new(&config.jwt_secret));
    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
