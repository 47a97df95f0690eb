use async_trait::async_trait;
use chrono::{Datelike, Utc};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

/// Durable blob storage for finished artifacts.
///
/// Uploads are at-least-once safe: every call writes a fresh object, so a
/// retried job simply gets a new URL.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the bytes and return a publicly resolvable URL.
    async fn upload(&self, data: &[u8], content_type: &str) -> Result<String, StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl ArtifactStore for R2Client {
    async fn upload(&self, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        let key = object_key(content_type);
        let response = self
            .bucket
            .put_object_with_content_type(&key, data, content_type)
            .await
            .map_err(StorageError::S3)?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(StorageError::Rejected { status });
        }

        tracing::debug!(key = %key, bytes = data.len(), "Uploaded artifact");
        Ok(self.public_url(&key))
    }
}

/// Fresh object key of the form `thumbnails/<yyyy>/<mm>/<uuid>.<ext>`.
pub fn object_key(content_type: &str) -> String {
    let now = Utc::now();
    format!(
        "thumbnails/{:04}/{:02}/{}.{}",
        now.year(),
        now.month(),
        Uuid::new_v4(),
        extension_for(content_type)
    )
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object store rejected upload with status {status}")]
    Rejected { status: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
