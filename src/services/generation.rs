use async_trait::async_trait;
use std::sync::Arc;

use crate::models::generation::{GenerationRequest, ReferenceImage};
use crate::models::thumbnail::AspectRatio;

/// Everything a backend needs to produce one image.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub reference_image: Option<ReferenceImage>,
}

/// Raw image produced by a backend (or by post-processing).
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// A text-to-image capability: prompt and optional image in, bytes out.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, input: &GenerationInput) -> Result<GeneratedImage, GenerationError>;
}

/// How a job is rendered, decided once per job before invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    TextToImage,
    ReferenceConditioned,
}

impl GenerationMode {
    pub fn for_job(job: &GenerationRequest) -> Self {
        if job.uses_reference_image && job.reference_image.is_some() && job.tier.allows_reference_image()
        {
            GenerationMode::ReferenceConditioned
        } else {
            GenerationMode::TextToImage
        }
    }
}

/// Routes each job to the text-to-image or the reference-conditioned backend.
#[derive(Clone)]
pub struct GenerationAdapter {
    text_to_image: Arc<dyn ImageGenerator>,
    reference_conditioned: Arc<dyn ImageGenerator>,
}

impl GenerationAdapter {
    pub fn new(
        text_to_image: Arc<dyn ImageGenerator>,
        reference_conditioned: Arc<dyn ImageGenerator>,
    ) -> Self {
        Self {
            text_to_image,
            reference_conditioned,
        }
    }

    pub async fn generate(
        &self,
        job: &GenerationRequest,
        prompt: &str,
    ) -> Result<GeneratedImage, GenerationError> {
        let mode = GenerationMode::for_job(job);
        let (generator, reference_image) = match mode {
            GenerationMode::TextToImage => (&self.text_to_image, None),
            GenerationMode::ReferenceConditioned => {
                (&self.reference_conditioned, job.reference_image.clone())
            }
        };

        tracing::debug!(record_id = %job.record_id, mode = ?mode, "Invoking generation backend");

        let input = GenerationInput {
            prompt: prompt.to_string(),
            aspect_ratio: job.aspect_ratio,
            reference_image,
        };
        generator.generate(&input).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Backend response contained no image payload")]
    NoImage,

    #[error("Image payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}
