// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, DashboardEvent};
use crate::types::Symbol;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/trades/open", get(open_trades))
        .route("/api/v1/signals/analyze/:symbol", post(analyze_symbol))
        .route("/api/v1/events", get(events))
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/emergency-stop", post(control_emergency_stop))
        .route("/api/v1/control/force-revalidate", post(control_force_revalidate))
        .route("/api/v1/heartbeat", post(heartbeat))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot().await)
}

async fn open_trades(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_open_trades().await {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn events(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let events: Vec<DashboardEvent> = state.recent_events.read().clone();
    Json(events)
}

async fn get_config(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.read().clone())
}

/// Runs a single on-demand scan of one symbol, mirroring the `analyze
/// <symbol>` CLI subcommand's behavior. Does not place any orders.
async fn analyze_symbol(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = match Symbol::parse(&symbol) {
        Ok(s) => s,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    };
    match state.scanner.scan_symbol(&symbol).await {
        Ok(Some(signal)) => Json(signal).into_response(),
        Ok(None) => Json(serde_json::json!({ "symbol": symbol.as_str(), "signal": null })).into_response(),
        Err(e) => (StatusCode::UNPROCESSABLE_ENTITY, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}

#[derive(Serialize)]
struct ControlResponse {
    message: String,
    paused: bool,
    emergency_stop: bool,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_paused(true);
    state.increment_version();
    info!("scanning paused via API");
    Json(ControlResponse { message: "scanning paused".into(), paused: true, emergency_stop: state.trading_engine.is_emergency_stopped() })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_paused(false);
    state.increment_version();
    info!("scanning resumed via API");
    Json(ControlResponse { message: "scanning resumed".into(), paused: false, emergency_stop: state.trading_engine.is_emergency_stopped() })
}

#[derive(Deserialize)]
struct EmergencyStopRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn control_emergency_stop(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmergencyStopRequest>,
) -> impl IntoResponse {
    let reason = req.reason.unwrap_or_else(|| "operator-triggered via API".to_string());
    warn!(%reason, "EMERGENCY STOP triggered via API");
    state.trigger_emergency_stop(reason.clone()).await;
    Json(ControlResponse { message: format!("emergency stop executed: {reason}"), paused: state.is_paused(), emergency_stop: true })
}

async fn control_force_revalidate(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scored = state.selector.force_refresh().await;
    state.increment_version();
    info!(count = scored.len(), "symbol universe force-revalidated via API");
    Json(serde_json::json!({ "revalidated": scored.len() }))
}

async fn heartbeat(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.increment_version();
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}
