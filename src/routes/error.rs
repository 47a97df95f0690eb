use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::services::admission::AdmissionError;

/// JSON body returned for every API error.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error kind, e.g. `insufficient_credits`.
    pub error: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Thumbnail not found")]
    NotFound,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Admission(err) => match err {
                AdmissionError::Validation(report) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "validation_error",
                    report.to_string(),
                ),
                AdmissionError::InvalidReferenceImage(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "invalid_reference_image",
                    err.to_string(),
                ),
                AdmissionError::AccountNotFound => {
                    (StatusCode::NOT_FOUND, "account_not_found", err.to_string())
                }
                AdmissionError::NoPlan => (StatusCode::FORBIDDEN, "no_plan", err.to_string()),
                AdmissionError::ReferenceImageNotAllowed { .. } => (
                    StatusCode::FORBIDDEN,
                    "feature_not_available",
                    err.to_string(),
                ),
                AdmissionError::InsufficientCredits { .. } => (
                    StatusCode::PAYMENT_REQUIRED,
                    "insufficient_credits",
                    err.to_string(),
                ),
                AdmissionError::Database(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                ),
                AdmissionError::Queue(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue_unavailable",
                    "Thumbnail generation is temporarily unavailable".to_string(),
                ),
            },
            ApiError::InvalidBody(rejection) => {
                (rejection.status(), "invalid_request", rejection.body_text())
            }
            ApiError::MissingToken => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        // Infrastructure details go to the log, not the client.
        if status.is_server_error() {
            tracing::error!(error_type, status = status.as_u16(), error = %self, "Server error");
        } else if status != StatusCode::NOT_FOUND {
            tracing::warn!(error_type, status = status.as_u16(), "Client error: {}", message);
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
