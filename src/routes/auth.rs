use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::routes::error::ApiError;

/// Claims carried by tokens from the account service.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id.
    pub sub: String,
    pub exp: u64,
}

/// Verifies HS256 bearer tokens issued by the account service.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Return the owner id of a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Result<Uuid, ApiError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            ApiError::InvalidToken
        })?;
        data.claims.sub.parse().map_err(|_| ApiError::InvalidToken)
    }
}

/// The authenticated caller. Anonymous requests are rejected with 401.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedOwner(pub Uuid);

impl FromRequestParts<AppState> for AuthenticatedOwner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::MissingToken)?;

        state.auth.verify(token).map(AuthenticatedOwner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(secret: &str, sub: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_owner() {
        let owner = Uuid::new_v4();
        let verifier = JwtVerifier::new(SECRET);
        assert_eq!(
            verifier.verify(&token(SECRET, &owner.to_string(), 3600)).unwrap(),
            owner
        );
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let expired = token(SECRET, &Uuid::new_v4().to_string(), -3600);
        assert!(matches!(verifier.verify(&expired), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let forged = token("other-secret", &Uuid::new_v4().to_string(), 3600);
        assert!(matches!(verifier.verify(&forged), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn test_subject_must_be_uuid() {
        let verifier = JwtVerifier::new(SECRET);
        let odd = token(SECRET, "user@example.com", 3600);
        assert!(matches!(verifier.verify(&odd), Err(ApiError::InvalidToken)));
    }
}
