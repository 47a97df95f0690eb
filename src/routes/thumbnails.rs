use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::thumbnail::{
    SubmitResponse, ThumbnailListResponse, ThumbnailRequest, ThumbnailStatusResponse,
};
use crate::routes::auth::AuthenticatedOwner;
use crate::routes::error::ApiError;
use crate::services::admission;

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

/// POST /api/v1/thumbnails: Admit a generation request.
///
/// Returns as soon as the job is queued; clients poll the status endpoint.
pub async fn submit_thumbnail(
    State(state): State<AppState>,
    AuthenticatedOwner(owner_id): AuthenticatedOwner,
    payload: Result<Json<ThumbnailRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = payload?;
    let admitted = admission::admit(&state.db, &*state.queue, owner_id, request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            thumbnail: admitted.record,
            credits: admitted.credits,
            message: "Thumbnail generation started".to_string(),
        }),
    ))
}

/// GET /api/v1/thumbnails/{id}: Poll one thumbnail.
pub async fn get_thumbnail(
    State(state): State<AppState>,
    AuthenticatedOwner(owner_id): AuthenticatedOwner,
    Path(thumbnail_id): Path<Uuid>,
) -> Result<Json<ThumbnailStatusResponse>, ApiError> {
    let thumbnail = queries::get_thumbnail_for_owner(&state.db, owner_id, thumbnail_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let (credits, total_credits) = queries::get_account(&state.db, owner_id)
        .await?
        .map(|account| (account.credits, account.total_credits))
        .unwrap_or_default();

    Ok(Json(ThumbnailStatusResponse {
        terminal: thumbnail.status.is_terminal(),
        thumbnail,
        credits,
        total_credits,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// Clamp a requested page size into the supported range.
pub fn list_limit(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT)
}

/// GET /api/v1/thumbnails: The caller's thumbnails, newest first.
pub async fn list_thumbnails(
    State(state): State<AppState>,
    AuthenticatedOwner(owner_id): AuthenticatedOwner,
    Query(params): Query<ListParams>,
) -> Result<Json<ThumbnailListResponse>, ApiError> {
    let thumbnails =
        queries::list_thumbnails_for_owner(&state.db, owner_id, list_limit(params.limit)).await?;

    Ok(Json(ThumbnailListResponse { thumbnails }))
}
