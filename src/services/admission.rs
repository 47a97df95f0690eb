use base64::Engine;
use garde::Validate;
use image::ImageFormat;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::account::{Account, Tier};
use crate::models::generation::{GenerationRequest, ReferenceImage};
use crate::models::thumbnail::{NewThumbnail, ReferenceImagePayload, ThumbnailRecord, ThumbnailRequest};
use crate::services::queue::{JobQueue, QueueError};

/// Largest accepted reference image after base64 decoding.
pub const MAX_REFERENCE_IMAGE_BYTES: usize = 8 * 1024 * 1024;

/// Result of the synchronous precondition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub credits_required: i32,
    pub priority: u32,
    pub uses_reference_image: bool,
}

/// An admitted request: the freshly created record and the pre-debit balance.
#[derive(Debug)]
pub struct Admission {
    pub record: ThumbnailRecord,
    pub credits: i32,
}

/// Check plan, feature and balance preconditions. Side-effect free.
pub fn assess(account: &Account, has_reference_image: bool) -> Result<AdmissionDecision, AdmissionError> {
    if account.tier == Tier::None {
        return Err(AdmissionError::NoPlan);
    }

    if has_reference_image && !account.tier.allows_reference_image() {
        return Err(AdmissionError::ReferenceImageNotAllowed { tier: account.tier });
    }

    let credits_required = account.tier.generation_cost(has_reference_image);
    if account.credits < credits_required {
        return Err(AdmissionError::InsufficientCredits {
            required: credits_required,
            available: account.credits,
        });
    }

    Ok(AdmissionDecision {
        credits_required,
        priority: account.tier.priority(),
        uses_reference_image: has_reference_image,
    })
}

/// Decode a submitted reference image (raw base64 or a `data:` URL).
pub fn decode_reference_image(payload: &ReferenceImagePayload) -> Result<ReferenceImage, AdmissionError> {
    let (declared_mime, data) = match payload.data.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest.split_once("base64,").ok_or_else(|| {
                AdmissionError::InvalidReferenceImage("data URL must be base64-encoded".to_string())
            })?;
            let mime = header.trim_end_matches(';').trim();
            (Some(mime).filter(|m| !m.is_empty()), data)
        }
        None => (payload.mime_type.as_deref(), payload.data.as_str()),
    };

    let data = data.trim();
    if data.len() / 4 * 3 > MAX_REFERENCE_IMAGE_BYTES + 3 {
        return Err(AdmissionError::InvalidReferenceImage(format!(
            "image exceeds {} bytes",
            MAX_REFERENCE_IMAGE_BYTES
        )));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| AdmissionError::InvalidReferenceImage(format!("invalid base64: {}", e)))?;

    if bytes.len() > MAX_REFERENCE_IMAGE_BYTES {
        return Err(AdmissionError::InvalidReferenceImage(format!(
            "image exceeds {} bytes",
            MAX_REFERENCE_IMAGE_BYTES
        )));
    }

    let format = image::guess_format(&bytes)
        .map_err(|_| AdmissionError::InvalidReferenceImage("unrecognised image format".to_string()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP) {
        return Err(AdmissionError::InvalidReferenceImage(format!(
            "unsupported image format {:?}",
            format
        )));
    }

    Ok(ReferenceImage {
        bytes,
        mime: declared_mime
            .map(str::to_string)
            .unwrap_or_else(|| format.to_mime_type().to_string()),
    })
}

/// Admit a generation request: validate, check preconditions, create the
/// record in `generating` state and enqueue the job. Does not wait for
/// generation, and does not touch the ledger.
pub async fn admit(
    pool: &PgPool,
    queue: &dyn JobQueue,
    owner_id: Uuid,
    request: ThumbnailRequest,
) -> Result<Admission, AdmissionError> {
    request.validate()?;

    let reference_image = request
        .reference_image
        .as_ref()
        .map(decode_reference_image)
        .transpose()?;

    let account = queries::get_account(pool, owner_id)
        .await?
        .ok_or(AdmissionError::AccountNotFound)?;

    let decision = assess(&account, reference_image.is_some())?;

    let title = request.title.trim().to_string();
    let detail = request
        .prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    let record = queries::create_thumbnail(
        pool,
        &NewThumbnail {
            owner_id,
            title: title.clone(),
            detail: detail.clone(),
            style: request.style,
            color_scheme: request.color_scheme,
            aspect_ratio: request.aspect_ratio,
            uses_reference_image: decision.uses_reference_image,
            credits_required: decision.credits_required,
        },
    )
    .await?;

    let job = GenerationRequest {
        record_id: record.id,
        owner_id,
        title,
        detail,
        style: request.style,
        color_scheme: request.color_scheme,
        aspect_ratio: request.aspect_ratio,
        reference_image,
        tier: account.tier,
        credits_required: decision.credits_required,
        uses_reference_image: decision.uses_reference_image,
    };

    if let Err(e) = queue.enqueue(&job, decision.priority).await {
        tracing::error!(record_id = %record.id, error = %e, "Failed to enqueue generation job");
        if let Err(db_err) =
            queries::mark_thumbnail_failed(pool, record.id, "Could not be queued for generation").await
        {
            tracing::error!(record_id = %record.id, error = %db_err, "Failed to close unqueued record");
        }
        return Err(AdmissionError::Queue(e));
    }

    metrics::counter!("thumbnail_jobs_submitted_total", "tier" => account.tier.to_string())
        .increment(1);

    tracing::info!(
        record_id = %record.id,
        owner_id = %owner_id,
        tier = %account.tier,
        priority = decision.priority,
        credits_required = decision.credits_required,
        reference_image = decision.uses_reference_image,
        "Thumbnail request admitted"
    );

    Ok(Admission {
        record,
        credits: account.credits,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Invalid request: {0}")]
    Validation(#[from] garde::Report),

    #[error("Invalid reference image: {0}")]
    InvalidReferenceImage(String),

    #[error("Account not found")]
    AccountNotFound,

    #[error("Please select a plan to generate thumbnails")]
    NoPlan,

    #[error("Reference images are not available on the {tier} plan")]
    ReferenceImageNotAllowed { tier: Tier },

    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i32, available: i32 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
