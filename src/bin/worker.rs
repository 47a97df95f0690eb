use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use thumbgen::config::AppConfig;
use thumbgen::db::{self, store::PgRecordStore};
use thumbgen::routes::metrics::describe_metrics;
use thumbgen::services::{
    encryption::EncryptionService,
    gemini::{GeminiClient, GeminiImageGenerator, ImagenGenerator},
    generation::GenerationAdapter,
    queue::{JobQueue, RedisJobQueue},
    storage::R2Client,
    watermark::Watermarker,
    worker::{Pipeline, WorkerPool},
};

const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting thumbnail generation worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("WORKER_METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");
    let queue = Arc::new(
        RedisJobQueue::new(&config.redis_url, Arc::new(encryption), config.retry_policy())
            .expect("Failed to initialize job queue"),
    );

    let gemini = GeminiClient::new(
        &config.gemini_api_key,
        &config.gemini_base_url,
        config.generation_timeout(),
    )
    .expect("Failed to initialize Gemini client");
    let generator = GenerationAdapter::new(
        Arc::new(ImagenGenerator::new(gemini.clone(), &config.imagen_model)),
        Arc::new(GeminiImageGenerator::new(gemini, &config.gemini_image_model)),
    );

    // A missing brand mark must stop startup; free-tier output is never shipped unmarked
    let watermarker =
        Watermarker::load(&config.watermark_path).expect("Failed to load watermark asset");

    let artifacts = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
        &config.r2_public_base_url,
    )
    .expect("Failed to initialize R2 client");

    let pipeline = Arc::new(Pipeline::new(
        generator,
        Arc::new(watermarker),
        Arc::new(artifacts),
        Arc::new(PgRecordStore::new(db_pool)),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(report_queue_depth(Arc::clone(&queue), shutdown_rx.clone()));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing in-flight jobs");
        }
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        concurrency = config.worker_concurrency,
        max_attempts = config.job_max_attempts,
        "Worker ready, starting job processing loop"
    );

    WorkerPool::new(queue, pipeline, config.worker())
        .run(shutdown_rx)
        .await;

    tracing::info!("Worker exited");
}

/// Publish the queue depth gauge until shutdown.
async fn report_queue_depth(queue: Arc<RedisJobQueue>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(QUEUE_DEPTH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => match queue.depth().await {
                Ok(depth) => metrics::gauge!("thumbnail_queue_depth").set(depth as f64),
                Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
            },
            _ = shutdown.changed() => break,
        }
    }
}
