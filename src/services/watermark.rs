use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::Path;

use crate::models::account::Tier;
use crate::services::generation::GeneratedImage;

/// Watermark width as a fraction of the image width.
const WATERMARK_WIDTH_RATIO: f64 = 0.15;

/// Distance of the watermark from the right and bottom edges, in pixels.
const WATERMARK_PADDING: u32 = 20;

/// Where and how large the brand mark lands on an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub width: u32,
    pub height: u32,
    pub left: u32,
    pub top: u32,
}

/// Compute the scaled mark size and its bottom-right position.
pub fn placement(image_width: u32, image_height: u32, mark_width: u32, mark_height: u32) -> Placement {
    let width = ((image_width as f64 * WATERMARK_WIDTH_RATIO).round() as u32).max(1);
    let height = ((mark_height as f64 * width as f64 / mark_width.max(1) as f64).round() as u32).max(1);

    Placement {
        width,
        height,
        left: image_width.saturating_sub(width + WATERMARK_PADDING),
        top: image_height.saturating_sub(height + WATERMARK_PADDING),
    }
}

/// Overlays the brand mark on free-tier artifacts.
pub struct Watermarker {
    mark: RgbaImage,
}

impl Watermarker {
    pub fn new(mark: DynamicImage) -> Self {
        Self {
            mark: mark.to_rgba8(),
        }
    }

    /// Load the brand mark asset from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WatermarkError> {
        let mark = image::open(path.as_ref()).map_err(|e| {
            WatermarkError::Asset(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self::new(mark))
    }

    /// Post-process a generated image according to the owner's tier.
    ///
    /// Free-tier images are always marked; a failure here fails the job rather
    /// than letting an unmarked image through.
    pub fn finish(&self, tier: Tier, image: GeneratedImage) -> Result<GeneratedImage, WatermarkError> {
        if !tier.requires_watermark() {
            return Ok(image);
        }
        let bytes = self.apply(&image.bytes)?;
        Ok(GeneratedImage {
            bytes,
            mime: "image/png".to_string(),
        })
    }

    /// Composite the mark onto encoded image bytes, returning PNG bytes.
    pub fn apply(&self, image_bytes: &[u8]) -> Result<Vec<u8>, WatermarkError> {
        let mut base = image::load_from_memory(image_bytes)?.to_rgba8();
        let (width, height) = base.dimensions();

        let spot = placement(width, height, self.mark.width(), self.mark.height());
        let mark = imageops::resize(&self.mark, spot.width, spot.height, FilterType::Lanczos3);
        imageops::overlay(&mut base, &mark, spot.left as i64, spot.top as i64);

        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(base).write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("Failed to load watermark asset: {0}")]
    Asset(String),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Watermark task aborted: {0}")]
    Aborted(String),
}
