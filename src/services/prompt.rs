//! Resolves style and color-scheme identifiers into prompt fragments and
//! composes the full generation prompt for a job.

use crate::models::generation::GenerationRequest;
use crate::models::thumbnail::{ColorScheme, Style};

pub fn style_fragment(style: Style) -> &'static str {
    match style {
        Style::BoldGraphic => {
            "eye-catching thumbnail, bold typography, vibrant colors, expressive facial reaction, \
             dramatic lighting, high contrast, click-worthy composition, professional style"
        }
        Style::TechFuturistic => {
            "futuristic thumbnail, sleek modern design, digital UI elements, glowing accents, \
             holographic effects, cyber-tech aesthetic, sharp lighting, high-tech atmosphere"
        }
        Style::Minimalist => {
            "minimalist thumbnail, clean layout, simple shapes, limited color palette, \
             plenty of negative space, modern flat design, clear focal point"
        }
        Style::Photorealistic => {
            "photorealistic thumbnail, ultra-realistic lighting, natural skin tones, candid moment, \
             DSLR-style photography, lifestyle realism, shallow depth of field"
        }
        Style::Illustrated => {
            "illustrated thumbnail, custom digital illustration, stylized characters, bold outlines, \
             vibrant colors, creative cartoon or vector art style"
        }
    }
}

/// `None` for `Unspecified`: no color clause is added to the prompt.
pub fn color_scheme_fragment(scheme: ColorScheme) -> Option<&'static str> {
    let fragment = match scheme {
        ColorScheme::Vibrant => {
            "vibrant and energetic colors, high saturation, bold contrasts, eye-catching palette"
        }
        ColorScheme::Sunset => {
            "warm sunset tones, orange pink and purple hues, soft gradients, cinematic glow"
        }
        ColorScheme::Forest => {
            "natural green tones, earthy colors, calm and organic palette, fresh atmosphere"
        }
        ColorScheme::Neon => {
            "neon glow effects, electric blues and pinks, cyberpunk lighting, high contrast glow"
        }
        ColorScheme::Purple => {
            "purple-dominant color palette, magenta and violet tones, modern and stylish mood"
        }
        ColorScheme::Monochrome => {
            "black and white color scheme, high contrast, dramatic lighting, timeless aesthetic"
        }
        ColorScheme::Ocean => {
            "cool blue and teal tones, aquatic color palette, fresh and clean atmosphere"
        }
        ColorScheme::Pastel => {
            "soft pastel colors, low saturation, gentle tones, calm and friendly aesthetic"
        }
        ColorScheme::Unspecified => return None,
    };
    Some(fragment)
}

/// Build the generation prompt for a job.
pub fn compose_prompt(job: &GenerationRequest) -> String {
    let mut prompt = format!(
        "Create a {} for: \"{}\"",
        style_fragment(job.style),
        job.title.trim()
    );

    if let Some(colors) = color_scheme_fragment(job.color_scheme) {
        prompt.push_str(&format!(" Use a {} color scheme.", colors));
    }

    if let Some(detail) = job.detail.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        prompt.push_str(&format!(" Additional details: {}.", detail));
    }

    if job.uses_reference_image {
        prompt.push_str(
            " Incorporate the person/subject from the reference image prominently in the \
             thumbnail, maintaining their likeness and features.",
        );
    }

    prompt.push_str(&format!(
        " The thumbnail should be {}, visually stunning, and designed to maximize \
         click-through rate. Make it bold, professional, and impossible to ignore.",
        job.aspect_ratio
    ));

    prompt
}

/// Wrap a prompt with the likeness instruction sent alongside a reference image.
pub fn reference_instruction(prompt: &str) -> String {
    format!(
        "Using the person/subject from this reference image, {} Make sure to incorporate \
         the person's likeness and features prominently in the generated thumbnail.",
        prompt
    )
}
