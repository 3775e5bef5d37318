//! Conversion submission routes.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{debug, info};

use crate::admission::RateDecision;
use crate::api::error::{ApiError, ApiResult};
use crate::api::extract::ClientId;
use crate::api::models::{ConversionTypesResponse, ConvertRequest, ConvertResponse};
use crate::api::server::AppState;
use crate::jobs::ConversionRequest;
use crate::utils::filename::sanitize_filename;

/// Create the conversion router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/convert", post(convert))
        .route("/conversions", get(list_conversion_types))
}

/// Submit a conversion.
///
/// Rate limited per client. Responds as soon as the job exists; clients poll
/// `/api/status` for progress.
async fn convert(
    State(state): State<AppState>,
    client: ClientId,
    Json(request): Json<ConvertRequest>,
) -> ApiResult<Response> {
    let decision = state.rate_limiter.check(client.as_str());
    let limit = state.rate_limiter.config().max_requests;
    let headers = rate_limit_headers(limit, &decision);

    if !decision.allowed {
        let retry_after = decision
            .retry_after
            .map(|d| d.as_secs_f64().ceil() as u64)
            .unwrap_or(1)
            .max(1);
        debug!(client = %client.as_str(), retry_after, "Conversion request rate limited");
        let mut response = ApiError::too_many_requests("Too many requests, please try again later.")
            .with_retry_after(retry_after)
            .with_details(serde_json::json!({
                "limit": limit,
                "retryAfterSecs": retry_after,
            }))
            .into_response();
        response.headers_mut().extend(headers);
        return Ok(response);
    }

    let conversion_type = request.conversion_type.trim();
    if conversion_type.is_empty() {
        return Err(ApiError::validation("conversionType is required"));
    }
    let input_path = state.artifacts.input_path(&request.file_id)?;
    let source_name = request
        .file_name
        .as_deref()
        .map(sanitize_filename)
        .unwrap_or_else(|| request.file_id.trim().to_string());

    let (job, _handle) = state.orchestrator.submit(ConversionRequest {
        input_path,
        source_name,
        conversion_type: conversion_type.to_string(),
        options: request.advanced_options,
    })?;

    info!(
        job_id = %job.id,
        client = %client.as_str(),
        conversion_type = %conversion_type,
        "Conversion submitted"
    );

    Ok((
        headers,
        Json(ConvertResponse {
            success: true,
            job_id: job.id,
        }),
    )
        .into_response())
}

/// List the conversion types the engine accepts.
async fn list_conversion_types(State(state): State<AppState>) -> Json<ConversionTypesResponse> {
    let conversion_types = state
        .orchestrator
        .engine()
        .conversion_types()
        .into_iter()
        .map(str::to_string)
        .collect();
    Json(ConversionTypesResponse { conversion_types })
}

fn rate_limit_headers(limit: u32, decision: &RateDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers
}
