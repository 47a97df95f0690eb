use serde::Deserialize;
use std::time::Duration;

use crate::services::queue::RetryPolicy;
use crate::services::worker::WorkerConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Address the worker exposes its Prometheus scrape endpoint on
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Gemini API key used for both image models
    pub gemini_api_key: String,

    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    /// Text-to-image model
    #[serde(default = "default_imagen_model")]
    pub imagen_model: String,

    /// Reference-conditioned image model
    #[serde(default = "default_gemini_image_model")]
    pub gemini_image_model: String,

    /// Per-request timeout for generation backend calls
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// Public base URL artifacts are served from
    pub r2_public_base_url: String,

    /// AES-256-GCM key sealing reference images on the queue (base64, 32 bytes)
    pub encryption_key: String,

    /// HS256 secret shared with the account service
    pub jwt_secret: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    #[serde(default = "default_job_max_attempts")]
    pub job_max_attempts: u32,

    /// Base of the exponential retry backoff
    #[serde(default = "default_job_backoff_ms")]
    pub job_backoff_ms: u64,

    /// How long a claimed job may run before it is redelivered
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,

    /// Brand mark composited onto free-tier images
    #[serde(default = "default_watermark_path")]
    pub watermark_path: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_gemini_base_url() -> String {
    crate::services::gemini::DEFAULT_BASE_URL.to_string()
}

fn default_imagen_model() -> String {
    "imagen-4.0-ultra-generate-001".to_string()
}

fn default_gemini_image_model() -> String {
    "gemini-3-pro-image-preview".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_job_max_attempts() -> u32 {
    3
}

fn default_job_backoff_ms() -> u64 {
    5000
}

fn default_job_lease_secs() -> u64 {
    300
}

fn default_watermark_path() -> String {
    "assets/watermark.png".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.job_max_attempts.max(1),
            backoff_base: Duration::from_millis(self.job_backoff_ms),
            lease: Duration::from_secs(self.job_lease_secs.max(1)),
            ..RetryPolicy::default()
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
        }
    }
}
