//! Test helper utilities for E2E testing

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Thumbnail record as returned by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct Thumbnail {
    pub id: Uuid,
    pub title: String,
    pub status: String,
    pub image_url: Option<String>,
    pub error: Option<String>,
    pub credits_required: i32,
}

/// Response from POST /api/v1/thumbnails
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub thumbnail: Thumbnail,
    pub credits: i32,
}

/// Response from GET /api/v1/thumbnails/{id}
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub thumbnail: Thumbnail,
    pub terminal: bool,
    pub credits: i32,
    pub total_credits: i32,
}

/// Error body returned by every endpoint
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: u64,
}

/// Owner the E2E account was provisioned for
pub fn test_owner() -> Uuid {
    std::env::var("TEST_OWNER_ID")
        .expect("TEST_OWNER_ID must be set")
        .parse()
        .expect("TEST_OWNER_ID must be a UUID")
}

/// Mint a bearer token the API accepts, signed with JWT_SECRET
pub fn bearer_token(owner: Uuid) -> String {
    let secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    let claims = Claims {
        sub: owner.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as u64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("Failed to sign token")
}

/// Submit a thumbnail request. Returns the raw response for status checks.
pub async fn submit_thumbnail(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    body: &serde_json::Value,
) -> Result<reqwest::Response, reqwest::Error> {
    client
        .post(format!("{}/api/v1/thumbnails", base_url))
        .bearer_auth(token)
        .json(body)
        .send()
        .await
}

/// Poll a thumbnail until it is terminal (with timeout)
pub async fn wait_for_thumbnail(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    id: Uuid,
    timeout_secs: u64,
) -> Result<StatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs; // Poll every second

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/thumbnails/{}", base_url, id))
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status = response.json::<StatusResponse>().await?;
        if status.terminal {
            return Ok(status);
        }

        if attempt % 10 == 0 && attempt > 0 {
            println!("  ... still generating (attempt {}/{})", attempt, max_attempts);
        }
        sleep(Duration::from_secs(1)).await;
    }

    Err(format!("Thumbnail did not finish within {} seconds", timeout_secs).into())
}
