//! Job status and result download routes.

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{DownloadQuery, JobResponse, StatusQuery};
use crate::api::server::AppState;
use crate::jobs::JobStatus;
use crate::sweeper::DeleteOnDrop;
use crate::utils::filename::content_disposition;

/// Create the jobs router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/download", get(download))
}

/// Current snapshot of a job.
async fn get_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<JobResponse>> {
    let job = state
        .job_store
        .get_job(query.job_id.trim())
        .ok_or_else(|| ApiError::not_found("Job not found"))?;
    Ok(Json(JobResponse::from(job)))
}

/// Stream one output of a completed job.
///
/// Deletion of the artifact is scheduled once the body is dropped, so a
/// retry shortly after a failed transfer can still succeed.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let not_found = || ApiError::not_found("File not found");

    let job = state
        .job_store
        .get_job(query.job_id.trim())
        .filter(|job| job.status == JobStatus::Completed)
        .ok_or_else(not_found)?;
    let file = job
        .result_files
        .get(query.file_index)
        .cloned()
        .ok_or_else(not_found)?;

    let Some((handle, len)) = state.artifacts.open(&file.path).await? else {
        warn!(job_id = %job.id, index = query.file_index, "Output requested after deletion");
        return Err(not_found());
    };

    debug!(job_id = %job.id, index = query.file_index, bytes = len, "Streaming output");

    let guard = DeleteOnDrop::new(
        state.sweeper.clone(),
        file.path.clone(),
        state.retention.download_cleanup_delay,
    );
    let stream = ReaderStream::new(handle).map(move |chunk| {
        let _ = &guard;
        chunk
    });

    let disposition = HeaderValue::from_str(&content_disposition(&file.file_name))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::CONTENT_LENGTH, HeaderValue::from(len)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
