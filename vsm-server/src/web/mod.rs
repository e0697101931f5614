//! Web server: axum REST API for uplink ingest and device records.
//!
//! Handlers share one [`UplinkProcessor`] and read records straight from
//! the state store.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use vsm_core::Result;

use crate::store::StateStore;
use crate::uplink::UplinkProcessor;

pub mod routes;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub processor: Arc<UplinkProcessor>,
    pub store: Arc<dyn StateStore>,
    /// Bearer token required on every route when set.
    pub auth_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/uplinks", post(routes::api_uplink))
        .route("/api/v1/devices", get(routes::api_devices))
        .route("/api/v1/devices/:id", get(routes::api_device_detail))
        .route("/api/v1/devices/:id/downlink", post(routes::api_downlink))
        .route("/api/v1/devices/:id/almanac", delete(routes::api_cancel_almanac))
        .with_state(state)
        .layer(cors)
}

/// Start the web server and run until the listener fails.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "VSM gateway listening");

    axum::serve(listener, app).await?;
    Ok(())
}
