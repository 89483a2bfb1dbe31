use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use http_body_util::BodyExt;
use std::collections::BTreeMap;
use tracing::debug;

use super::{
    error::ApiError,
    models::{HealthResponse, ProduceRequest, ProduceResponse},
    state::AppState,
};

/// Message ingest endpoint (POST /)
///
/// ## Flow:
/// 1. Refuse with 503 while the pipeline reports unhealthy
/// 2. Validate Content-Type (application/json)
/// 3. Read the body (gzip already decoded by middleware) and enforce the size limit
/// 4. Parse `{topic, key, data}`; the topic must not be empty
/// 5. Hand the message to the pipeline, waiting while its first queue is full
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    state
        .app
        .is_healthy()
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    super::utils::require_json(&headers)?;

    let body_bytes = read_body(body, state.max_payload_bytes).await?;

    let request: ProduceRequest = serde_json::from_slice(&body_bytes)?;
    if request.topic.trim().is_empty() {
        return Err(ApiError::InvalidPayload("topic must not be empty".into()));
    }

    debug!(topic = %request.topic, size = body_bytes.len(), "Message received");
    state
        .app
        .send(request.topic, request.key, request.data)
        .await?;

    Ok((
        StatusCode::OK,
        Json(ProduceResponse {
            status: "accepted".to_string(),
        }),
    ))
}

/// Reads request body and validates size
async fn read_body(body: axum::body::Body, max_size: usize) -> Result<Vec<u8>, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes()
        .to_vec();

    super::utils::validate_body_size(&data, max_size)?;

    Ok(data)
}

/// Health check endpoint (GET /health)
///
/// Reports each producer and the lost-message count. Returns 503 once any
/// producer is unhealthy or any message has been lost.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let components: BTreeMap<String, String> = state
        .app
        .producer_health()
        .into_iter()
        .map(|(name, healthy)| {
            let status = if healthy { "healthy" } else { "unhealthy" };
            (name, status.to_string())
        })
        .collect();

    let verdict = state.app.is_healthy();
    let status_code = match verdict {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    let response = HealthResponse {
        status: if verdict.is_ok() { "healthy" } else { "unhealthy" }.to_string(),
        components,
        lost: state.app.lost(),
        reason: verdict.err().map(|e| e.to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}

/// In-process counters and queue gauges (GET /metrics)
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.app.metrics_snapshot())
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("route".to_string())
}
