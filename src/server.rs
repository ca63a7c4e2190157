//! HTTP API for the dashboard.
//!
//! Thin layer over the orchestrator and device tracker; all state is
//! injected explicitly at construction. Authentication lives in front of
//! this service and is out of scope here.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::devices::{self, DeviceTracker};
use crate::error::RouterError;
use crate::orchestrator::Orchestrator;
use crate::probe;
use crate::settings::{ApConfig, DhcpConfig, UplinkConfig};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub tracker: Arc<RwLock<DeviceTracker>>,
}

pub struct ServerConfig {
    pub port: u16,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(err: RouterError) -> ApiError {
    let status = match &err {
        RouterError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RouterError::Busy(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

pub async fn run_server(config: ServerConfig, state: AppState) -> anyhow::Result<()> {
    // The tracker's single writer: one background poller per process.
    tokio::spawn(devices::run_poller(
        state.tracker.clone(),
        state.orchestrator.lease_file().clone(),
        std::time::Duration::from_secs(15),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/all", get(devices_all_handler))
        .route("/api/portal/detect", get(detect_portal_handler))
        .route("/api/portal/login", post(login_portal_handler))
        .route("/api/uplink", post(apply_uplink_handler))
        .route("/api/ap", post(apply_ap_handler))
        .route("/api/dhcp", post(apply_dhcp_handler))
        .layer(cors)
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let orch = &state.orchestrator;
    let uplink = probe::uplink_status(orch.uplink_interface())
        .await
        .map_err(api_error)?;
    let ap = probe::ap_status(orch.ap_interface(), orch.lease_file())
        .await
        .map_err(api_error)?;
    let nat = probe::nat_active().await.unwrap_or(false);

    Ok(Json(json!({ "uplink": uplink, "ap": ap, "nat_enabled": nat })))
}

async fn devices_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tracker = state.tracker.read().await;
    Json(json!({ "devices": tracker.active_roster(chrono::Utc::now()) }))
}

async fn devices_all_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tracker = state.tracker.read().await;
    Json(json!({ "devices": tracker.all_devices() }))
}

async fn detect_portal_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.orchestrator.detect_portal().await.map_err(api_error)?;
    Ok(Json(serde_json::to_value(session).unwrap_or_default()))
}

#[derive(Deserialize)]
struct PortalLoginRequest {
    url: String,
    username: Option<String>,
    password: Option<String>,
}

async fn login_portal_handler(
    State(state): State<AppState>,
    Json(req): Json<PortalLoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .orchestrator
        .login_portal(&req.url, req.username.as_deref(), req.password.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "success": outcome.success, "message": outcome.message })))
}

async fn apply_uplink_handler(
    State(state): State<AppState>,
    Json(cfg): Json<UplinkConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.orchestrator.apply_uplink(&cfg).await.map_err(api_error)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

async fn apply_ap_handler(
    State(state): State<AppState>,
    Json(cfg): Json<ApConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.orchestrator.apply_ap(&cfg).await.map_err(api_error)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

async fn apply_dhcp_handler(
    State(state): State<AppState>,
    Json(cfg): Json<DhcpConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.orchestrator.apply_dhcp(&cfg).await.map_err(api_error)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}
