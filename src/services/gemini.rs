use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::services::generation::{GeneratedImage, GenerationError, GenerationInput, ImageGenerator};
use crate::services::prompt;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Shared HTTP plumbing for the Google generative language API.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    /// Every request is bounded by `timeout`; expiry surfaces as a retryable HTTP error.
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn call<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        model: &str,
        method: &str,
        body: &B,
    ) -> Result<R, GenerationError> {
        let url = format!("{}/v1beta/models/{}:{}", self.base_url, model, method);

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

// ── Imagen (single-shot text-to-image) ─────────────────────────────

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: [PredictInstance<'a>; 1],
    parameters: PredictParameters<'a>,
}

#[derive(Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters<'a> {
    sample_count: u32,
    aspect_ratio: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

/// Plain text-to-image generation through an Imagen model.
pub struct ImagenGenerator {
    client: GeminiClient,
    model: String,
}

impl ImagenGenerator {
    pub fn new(client: GeminiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ImageGenerator for ImagenGenerator {
    async fn generate(&self, input: &GenerationInput) -> Result<GeneratedImage, GenerationError> {
        let request = PredictRequest {
            instances: [PredictInstance {
                prompt: &input.prompt,
            }],
            parameters: PredictParameters {
                sample_count: 1,
                aspect_ratio: input.aspect_ratio.as_ref(),
            },
        };

        let response: PredictResponse = self.client.call(&self.model, "predict", &request).await?;
        image_from_predictions(response)
    }
}

fn image_from_predictions(response: PredictResponse) -> Result<GeneratedImage, GenerationError> {
    let prediction = response
        .predictions
        .into_iter()
        .find(|p| p.bytes_base64_encoded.is_some())
        .ok_or(GenerationError::NoImage)?;

    let data = prediction.bytes_base64_encoded.unwrap_or_default();
    decode_image(&data, prediction.mime_type)
}

// ── Gemini (multimodal, reference-conditioned) ─────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: [&'static str; 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

/// Response parts are heterogeneous; only `inlineData` carries an image.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// Reference-conditioned generation through a multimodal Gemini image model.
pub struct GeminiImageGenerator {
    client: GeminiClient,
    model: String,
}

impl GeminiImageGenerator {
    pub fn new(client: GeminiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageGenerator {
    async fn generate(&self, input: &GenerationInput) -> Result<GeneratedImage, GenerationError> {
        let mut parts = Vec::with_capacity(2);
        let instruction = match &input.reference_image {
            Some(reference) => {
                parts.push(Part {
                    inline_data: Some(InlineData {
                        mime_type: Some(reference.mime.clone()),
                        data: Some(base64::engine::general_purpose::STANDARD.encode(&reference.bytes)),
                    }),
                    ..Part::default()
                });
                prompt::reference_instruction(&input.prompt)
            }
            None => input.prompt.clone(),
        };
        parts.push(Part {
            text: Some(instruction),
            ..Part::default()
        });

        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
            generation_config: GenerationConfig {
                response_modalities: ["TEXT", "IMAGE"],
            },
        };

        let response: GenerateContentResponse = self
            .client
            .call(&self.model, "generateContent", &request)
            .await?;
        image_from_candidates(response)
    }
}

fn image_from_candidates(response: GenerateContentResponse) -> Result<GeneratedImage, GenerationError> {
    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    let inline = parts
        .into_iter()
        .filter_map(|p| p.inline_data)
        .find(|d| d.data.as_deref().is_some_and(|s| !s.is_empty()))
        .ok_or(GenerationError::NoImage)?;

    decode_image(&inline.data.unwrap_or_default(), inline.mime_type)
}

fn decode_image(data: &str, mime: Option<String>) -> Result<GeneratedImage, GenerationError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
    if bytes.is_empty() {
        return Err(GenerationError::NoImage);
    }
    Ok(GeneratedImage {
        bytes,
        mime: mime.unwrap_or_else(|| "image/png".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictions_yield_first_image() {
        let response: PredictResponse = serde_json::from_value(serde_json::json!({
            "predictions": [
                { "raiFilteredReason": "blocked" },
                { "bytesBase64Encoded": "aGVsbG8=", "mimeType": "image/png" }
            ]
        }))
        .unwrap();

        let image = image_from_predictions(response).unwrap();
        assert_eq!(image.bytes, b"hello");
        assert_eq!(image.mime, "image/png");
    }

    #[test]
    fn test_empty_predictions_is_no_image() {
        let response: PredictResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            image_from_predictions(response),
            Err(GenerationError::NoImage)
        ));
    }

    #[test]
    fn test_candidates_skip_text_parts() {
        let response: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "Here is your thumbnail" },
                        { "inlineData": { "mimeType": "image/jpeg", "data": "aGk=" } },
                        { "inlineData": { "mimeType": "image/png", "data": "bm8=" } }
                    ]
                }
            }]
        }))
        .unwrap();

        let image = image_from_candidates(response).unwrap();
        assert_eq!(image.bytes, b"hi");
        assert_eq!(image.mime, "image/jpeg");
    }

    #[test]
    fn test_text_only_candidate_is_no_image() {
        let response: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "I cannot do that" }] } }]
        }))
        .unwrap();
        assert!(matches!(
            image_from_candidates(response),
            Err(GenerationError::NoImage)
        ));

        let empty: GenerateContentResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(matches!(
            image_from_candidates(empty),
            Err(GenerationError::NoImage)
        ));
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        let response: PredictResponse = serde_json::from_value(serde_json::json!({
            "predictions": [{ "bytesBase64Encoded": "***" }]
        }))
        .unwrap();
        assert!(matches!(
            image_from_predictions(response),
            Err(GenerationError::Decode(_))
        ));
    }

    #[test]
    fn test_request_wire_shape() {
        let request = PredictRequest {
            instances: [PredictInstance { prompt: "p" }],
            parameters: PredictParameters {
                sample_count: 1,
                aspect_ratio: "16:9",
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["parameters"]["sampleCount"], 1);
        assert_eq!(value["parameters"]["aspectRatio"], "16:9");
        assert_eq!(value["instances"][0]["prompt"], "p");
    }
}
