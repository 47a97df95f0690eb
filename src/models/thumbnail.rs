use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Visual style of a thumbnail. Unknown keys fall back to `Bold & Graphic`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, AsRefStr, EnumIter,
)]
pub enum Style {
    #[default]
    #[strum(serialize = "Bold & Graphic")]
    BoldGraphic,
    #[strum(serialize = "Tech/Futuristic")]
    TechFuturistic,
    Minimalist,
    Photorealistic,
    Illustrated,
}

impl Style {
    pub fn from_key(key: &str) -> Self {
        key.parse().unwrap_or_default()
    }
}

/// Color palette of a thumbnail. Unknown or missing keys become `Unspecified`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum ColorScheme {
    Vibrant,
    Sunset,
    Forest,
    Neon,
    Purple,
    Monochrome,
    Ocean,
    Pastel,
    #[default]
    Unspecified,
}

impl ColorScheme {
    pub fn from_key(key: &str) -> Self {
        key.parse().unwrap_or_default()
    }
}

// Lenient (de)serialization through the string key so that unknown
// identifiers resolve to the defined fallback instead of failing.
macro_rules! keyed_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_ref())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let key = String::deserialize(deserializer)?;
                Ok(<$ty>::from_key(&key))
            }
        }
    };
}

keyed_serde!(Style);
keyed_serde!(ColorScheme);

/// Output aspect ratio supported by the generation backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    #[strum(serialize = "16:9")]
    Landscape,
    #[serde(rename = "1:1")]
    #[strum(serialize = "1:1")]
    Square,
    #[serde(rename = "9:16")]
    #[strum(serialize = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    #[strum(serialize = "4:3")]
    Standard,
    #[serde(rename = "3:4")]
    #[strum(serialize = "3:4")]
    Tall,
}

/// Lifecycle of a thumbnail record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThumbnailStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl ThumbnailStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThumbnailStatus::Completed | ThumbnailStatus::Failed)
    }
}

/// Persisted projection of a generation request and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub detail: Option<String>,
    pub prompt: Option<String>,
    pub style: Style,
    pub color_scheme: ColorScheme,
    pub aspect_ratio: AspectRatio,
    pub status: ThumbnailStatus,
    pub image_url: Option<String>,
    pub error: Option<String>,
    pub uses_reference_image: bool,
    pub credits_required: i32,
    pub credits_charged: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Insert payload for a freshly admitted record.
#[derive(Debug, Clone)]
pub struct NewThumbnail {
    pub owner_id: Uuid,
    pub title: String,
    pub detail: Option<String>,
    pub style: Style,
    pub color_scheme: ColorScheme,
    pub aspect_ratio: AspectRatio,
    pub uses_reference_image: bool,
    pub credits_required: i32,
}

/// Reference image as submitted: base64, optionally as a `data:` URL.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceImagePayload {
    pub data: String,
    pub mime_type: Option<String>,
}

/// Body of `POST /api/v1/thumbnails`.
#[derive(Debug, Deserialize, Validate)]
pub struct ThumbnailRequest {
    #[garde(length(chars, min = 1, max = 200))]
    #[serde(deserialize_with = "trimmed")]
    pub title: String,

    #[garde(length(chars, max = 1000))]
    #[serde(default, deserialize_with = "trimmed_opt")]
    pub prompt: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub style: Style,

    #[garde(skip)]
    #[serde(default)]
    pub color_scheme: ColorScheme,

    #[garde(skip)]
    #[serde(default)]
    pub aspect_ratio: AspectRatio,

    #[garde(skip)]
    pub reference_image: Option<ReferenceImagePayload>,
}

fn trimmed<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    Ok(value.trim().to_string())
}

fn trimmed_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.map(|v| v.trim().to_string()))
}

/// Response after admitting a thumbnail request.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub thumbnail: ThumbnailRecord,
    pub credits: i32,
    pub message: String,
}

/// Response for polling a single thumbnail.
#[derive(Debug, Serialize)]
pub struct ThumbnailStatusResponse {
    pub thumbnail: ThumbnailRecord,
    pub terminal: bool,
    pub credits: i32,
    pub total_credits: i32,
}

/// Response for listing an owner's thumbnails.
#[derive(Debug, Serialize)]
pub struct ThumbnailListResponse {
    pub thumbnails: Vec<ThumbnailRecord>,
}
