use uuid::Uuid;

use crate::models::account::Tier;
use crate::models::thumbnail::{AspectRatio, ColorScheme, Style};

/// Fixed prefix of every generation job name on the queue.
pub const JOB_NAME_PREFIX: &str = "thumbnail";

/// Decoded reference image supplied by the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Immutable snapshot of one generation job, taken at admission time.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub record_id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub detail: Option<String>,
    pub style: Style,
    pub color_scheme: ColorScheme,
    pub aspect_ratio: AspectRatio,
    pub reference_image: Option<ReferenceImage>,
    /// Tier at enqueue time; later plan changes do not affect the job.
    pub tier: Tier,
    pub credits_required: i32,
    /// Whether the reference image was both supplied and permitted.
    pub uses_reference_image: bool,
}

impl GenerationRequest {
    pub fn job_name(&self) -> String {
        job_name(self.record_id)
    }
}

pub fn job_name(record_id: Uuid) -> String {
    format!("{}:{}", JOB_NAME_PREFIX, record_id)
}

/// Recover the record id from a job name, if it is one of ours.
pub fn record_id_from_job_name(name: &str) -> Option<Uuid> {
    name.strip_prefix(JOB_NAME_PREFIX)?
        .strip_prefix(':')?
        .parse()
        .ok()
}
