//! HTTP and WebSocket surface over [`SentryPipeline`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use sentry_types::{AlertVerdict, ConnectionState, DeviceDescriptor, GpsFix};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::error::HubError;
use crate::pipeline::SentryPipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SentryPipeline>,
    pub scan_duration: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "sentry-hub ok" }))
        .route("/devices", get(scan_devices))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/state", get(hub_state))
        .route("/cooldown", put(set_cooldown))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

// ── Errors ────────────────────────────────────────────────────────────────────

pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HubError::PermissionDenied => StatusCode::FORBIDDEN,
            HubError::RadioDisabled => StatusCode::SERVICE_UNAVAILABLE,
            HubError::ScanInProgress | HubError::Busy(_) | HubError::AlreadyConnected => StatusCode::CONFLICT,
            HubError::Link(_) => StatusCode::BAD_GATEWAY,
            HubError::Closed => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ── Requests & views ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ScanParams {
    /// Seconds
    pub duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CooldownRequest {
    pub seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct HubStateView {
    pub connection: ConnectionState,
    pub cooldown_seconds: u64,
    pub processing: bool,
    pub last_verdict: Option<AlertVerdict>,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub latest_gps: Option<GpsFix>,
    pub last_device_id: Option<String>,
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn scan_devices(
    State(state): State<AppState>,
    Query(params): Query<ScanParams>,
) -> Result<Json<Vec<DeviceDescriptor>>, ApiError> {
    let duration = params
        .duration
        .map(|s| Duration::from_secs(s.clamp(1, 30)))
        .unwrap_or(state.scan_duration);
    Ok(Json(state.pipeline.scan_for_devices(duration).await?))
}

async fn connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connected = state.pipeline.connect(&req.device_id).await?;
    Ok(Json(json!({ "connected": connected })))
}

async fn disconnect(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.pipeline.disconnect().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn hub_state(State(state): State<AppState>) -> Json<HubStateView> {
    let p = &state.pipeline;
    let status = p.escalation_status();
    Json(HubStateView {
        connection: p.connection_state(),
        cooldown_seconds: p.cooldown().as_secs(),
        processing: status.processing,
        last_verdict: status.last_verdict,
        last_alert_at: status.last_alert_at,
        latest_gps: p.latest_gps(),
        last_device_id: p.settings().await.last_device_id,
    })
}

async fn set_cooldown(
    State(state): State<AppState>,
    Json(req): Json<CooldownRequest>,
) -> Json<serde_json::Value> {
    let applied = state.pipeline.set_cooldown_seconds(req.seconds).await;
    Json(json!({ "cooldown_seconds": applied.as_secs() }))
}

// ── WebSocket feed ────────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state.pipeline))
}

fn event<T: Serialize>(kind: &str, data: T) -> Message {
    Message::Text(json!({ "type": kind, "data": data }).to_string())
}

async fn handle_ws(mut socket: WebSocket, pipeline: Arc<SentryPipeline>) {
    let mut readings = pipeline.subscribe_readings();
    let mut gps = pipeline.subscribe_gps();
    let mut triggers = pipeline.subscribe_triggers();
    let mut verdicts = pipeline.subscribe_verdicts();
    let mut state = pipeline.subscribe_state();
    info!("🖥  WebSocket client attached");

    // current state first
    let current = *state.borrow_and_update();
    if socket.send(event("connection_state", current)).await.is_err() {
        return;
    }

    loop {
        let msg = tokio::select! {
            r = readings.recv() => match r {
                Ok(r) => event("reading", r),
                Err(RecvError::Lagged(n)) => { debug!("ws client lagged {n} readings"); continue; }
                Err(RecvError::Closed) => break,
            },
            g = gps.recv() => match g {
                Ok(g) => event("gps", g),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            t = triggers.recv() => match t {
                Ok(t) => event("threshold", t),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            v = verdicts.recv() => match v {
                Ok(v) => event("verdict", v),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = *state.borrow_and_update();
                event("connection_state", s)
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };
        if socket.send(msg).await.is_err() {
            break;
        }
    }
    info!("🖥  WebSocket client detached");
}
