//! Input upload route.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    routing::post,
};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{UploadQuery, UploadResponse};
use crate::api::server::AppState;
use crate::utils::filename::sanitize_filename;

/// Create the upload router.
pub fn router() -> Router<AppState> {
    Router::new().route("/upload", post(upload))
}

/// Store the raw request body as a conversion input.
///
/// The input is scheduled for deletion right away so an unclaimed upload
/// does not linger. A conversion that claims it holds a lease until the job
/// ends, which overrides this deadline.
async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<Json<UploadResponse>> {
    if body.is_empty() {
        return Err(ApiError::validation("Request body is empty"));
    }

    let file_name = sanitize_filename(query.file_name.as_deref().unwrap_or_default());
    let (file_id, path) = state.artifacts.save_upload(&body).await?;
    state
        .sweeper
        .schedule_delete(path, state.retention.input_cleanup_delay);

    info!(file_id = %file_id, file_name = %file_name, size = body.len(), "Upload stored");

    Ok(Json(UploadResponse {
        success: true,
        file_id,
        file_name,
        size: body.len() as u64,
    }))
}
