//! Runtime log filter routes.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{LogFilterResponse, UpdateLogFilterRequest};
use crate::api::server::AppState;

/// Create the logging router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_filter).put(update_filter))
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterResponse>> {
    let logging = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging is not configured"))?;
    Ok(Json(LogFilterResponse {
        filter: logging.get_filter(),
    }))
}

/// Replace the active filter, e.g. `{"filter": "fileforge=debug"}`.
async fn update_filter(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LogFilterResponse>> {
    let logging = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging is not configured"))?;
    logging.set_filter(&request.filter)?;
    Ok(Json(LogFilterResponse {
        filter: logging.get_filter(),
    }))
}
