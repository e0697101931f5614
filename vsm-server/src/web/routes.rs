//! REST API route handlers.
//!
//! Every handler checks the bearer token first, then maps errors to status
//! codes: bad input is 400, unknown device 404, a failed downlink 502.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use vsm_core::VsmError;

use crate::store::StoreError;
use crate::uplink::{Outcome, Uplink};
use crate::web::AppState;

type ApiResponse = (StatusCode, Json<Value>);

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkRequest {
    port: u8,
    payload_hex: String,
    #[serde(default)]
    confirmed: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Validate bearer token if auth is configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiResponse> {
    let expected = match &state.auth_token {
        Some(t) => t,
        None => return Ok(()),
    };

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(token) = auth_header.strip_prefix("Bearer ") {
        if token == expected {
            return Ok(());
        }
    }

    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "invalid or missing bearer token"})),
    ))
}

fn error_response(e: &VsmError) -> ApiResponse {
    let status = match e {
        VsmError::InvalidHex(_) | VsmError::Validation(_) => StatusCode::BAD_REQUEST,
        VsmError::Downlink(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "request failed");
    } else {
        warn!(error = %e, "request rejected");
    }
    (status, Json(json!({"error": e.to_string()})))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/uplinks
pub async fn api_uplink(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(uplink): Json<Uplink>,
) -> ApiResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.processor.handle(uplink).await {
        Ok(Outcome::Stored(record)) => (
            StatusCode::OK,
            Json(json!({"status": "stored", "state": record})),
        ),
        Ok(Outcome::Ignored) => (StatusCode::OK, Json(json!({"status": "ignored"}))),
        Ok(Outcome::NoResult) => (StatusCode::OK, Json(json!({"status": "no_result"}))),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/devices
pub async fn api_devices(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.store.list().await {
        Ok(rows) => (
            StatusCode::OK,
            Json(json!({"count": rows.len(), "devices": rows})),
        ),
        Err(e) => error_response(&e.into()),
    }
}

/// GET /api/v1/devices/:id
pub async fn api_device_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.store.fetch(&device_id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({"deviceId": device_id, "state": record})),
        ),
        Err(StoreError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "device not found"})),
        ),
        Err(e) => error_response(&e.into()),
    }
}

/// POST /api/v1/devices/:id/downlink
pub async fn api_downlink(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    Json(body): Json<DownlinkRequest>,
) -> ApiResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state
        .processor
        .send_downlink(&device_id, body.port, &body.payload_hex, body.confirmed)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "sent", "deviceId": device_id, "port": body.port})),
        ),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/v1/devices/:id/almanac
pub async fn api_cancel_almanac(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    let cancelled = state.processor.cancel_almanac(&device_id);
    (
        StatusCode::OK,
        Json(json!({"deviceId": device_id, "cancelled": cancelled})),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
