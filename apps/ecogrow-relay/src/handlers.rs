//! Polling API: a stateless HTTP surface over the registry and the cache.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use ecogrow_proto::{DeviceId, Telemetry};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use crate::config::RelayConfig;
use crate::device_api::{DeviceApiClient, DeviceApiError};
use crate::error::RelayError;
use crate::router::{Command, MessageRouter};
use crate::session::Subscription;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub router: MessageRouter,
    pub config: Arc<RelayConfig>,
    pub metrics: Option<PrometheusHandle>,
    pub device_api: Option<DeviceApiClient>,
}

impl AppState {
    pub fn new(
        router: MessageRouter,
        config: RelayConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, DeviceApiError> {
        let device_api = config
            .device_api
            .as_ref()
            .map(DeviceApiClient::new)
            .transpose()?;
        Ok(Self {
            router,
            config: Arc::new(config),
            metrics,
            device_api,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/data/:device_id", get(device_data))
        .route("/api/command/:device_id", post(send_command))
        .route("/api/status", get(status))
        .route("/admin", get(admin))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::new(state.config.http_timeout));

    // Bounded by the device client deadline rather than the request timeout layer.
    let mut passthrough = Router::new();
    if state.device_api.is_some() {
        passthrough = passthrough
            .route("/api/proxy/status", get(proxy_status))
            .route("/api/device/*endpoint", any(device_passthrough));
    }

    let ws = Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler));

    Router::new()
        .merge(api)
        .merge(passthrough)
        .merge(ws)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Unavailable(&'static str),
    BadRequest(String),
    DeviceApi(DeviceApiError),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    success: bool,
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, code) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.to_string(), None),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.to_string(), None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), Some("bad_request")),
            ApiError::DeviceApi(err) => (err.status(), err.to_string(), Some(err.code())),
        };
        (
            status,
            Json(ApiErrorBody {
                success: false,
                error: &error,
                code,
            }),
        )
            .into_response()
    }
}

impl From<DeviceApiError> for ApiError {
    fn from(err: DeviceApiError) -> Self {
        ApiError::DeviceApi(err)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceSummary {
    id: DeviceId,
    online: bool,
    ip: Option<String>,
    last_seen: Option<String>,
    last_data: Option<Telemetry>,
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    let router = &state.router;
    let mut devices: Vec<DeviceSummary> = router
        .registry()
        .all_devices()
        .into_iter()
        .map(|session| DeviceSummary {
            id: session.id().clone(),
            online: session.is_online(),
            ip: session.remote_ip().map(|ip| ip.to_string()),
            last_seen: Some(rfc3339(session.last_seen())),
            last_data: router.cache().get(session.id().as_str()).map(|s| s.annotated()),
        })
        .collect();

    for snapshot in router.cache().get_all() {
        if devices.iter().any(|d| d.id == snapshot.device_id) {
            continue;
        }
        devices.push(DeviceSummary {
            id: snapshot.device_id.clone(),
            online: false,
            ip: snapshot.source_ip.map(|ip| ip.to_string()),
            last_seen: Some(rfc3339(snapshot.received_at)),
            last_data: Some(snapshot.annotated()),
        });
    }
    devices.sort_by(|a, b| a.id.cmp(&b.id));

    Json(json!({ "success": true, "devices": devices }))
}

async fn device_data(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .router
        .cache()
        .get(&device_id)
        .ok_or(ApiError::NotFound("Device not found"))?;
    Ok(Json(json!({ "success": true, "data": snapshot.annotated() })))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    value: Value,
}

async fn send_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let device = DeviceId::parse(&device_id).map_err(|_| ApiError::NotFound("Device not found"))?;
    if request.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".into()));
    }

    match state
        .router
        .dispatch_command(Command::new(device, request.command, request.value))
    {
        Ok(()) => Ok(Json(json!({ "success": true, "message": "Command sent" }))),
        Err(RelayError::DeviceNotFound(_)) => Err(ApiError::NotFound("Device not found")),
        Err(RelayError::DeviceOffline(_)) => Err(ApiError::Unavailable("Device not connected")),
        Err(err) => {
            warn!(device_id = %device_id, error = %err, "command dispatch failed");
            Err(ApiError::Unavailable("Device not connected"))
        }
    }
}

/// Public base URLs as seen by the caller, derived from its Host header.
fn endpoints(headers: &HeaderMap, config: &RelayConfig) -> Value {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| config.listen_addr.to_string());
    json!({
        "webSocket": format!("ws://{host}/ws"),
        "http": format!("http://{host}"),
        "api": format!("http://{host}/api"),
    })
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let router = &state.router;
    Json(json!({
        "status": "running",
        "server": router.server().name,
        "version": router.server().version,
        "devices": router.registry().device_count(),
        "webClients": router.registry().viewer_count(),
        "uptime": router.uptime().as_secs_f64(),
        "serverTime": rfc3339(Utc::now()),
        "endpoints": endpoints(&headers, &state.config),
    }))
}

async fn admin(State(state): State<AppState>) -> Json<Value> {
    let router = &state.router;
    let devices: Vec<Value> = router
        .registry()
        .all_devices()
        .into_iter()
        .map(|session| {
            json!({
                "id": session.id(),
                "connectionId": session.connection_id(),
                "ip": session.remote_ip().map(|ip| ip.to_string()),
                "connectedAt": rfc3339(session.connected_at()),
                "lastSeen": rfc3339(session.last_seen()),
                "state": session.state(),
                "online": session.is_online(),
            })
        })
        .collect();
    let viewers: Vec<Value> = router
        .registry()
        .all_viewers()
        .into_iter()
        .map(|viewer| {
            let subscription = match viewer.subscription() {
                Subscription::All => Value::from("all"),
                Subscription::Device(id) => Value::from(id.as_str()),
            };
            json!({
                "id": viewer.id(),
                "subscription": subscription,
                "ip": viewer.remote_addr().map(|addr| addr.ip().to_canonical().to_string()),
                "connectedAt": rfc3339(viewer.connected_at()),
            })
        })
        .collect();

    Json(json!({
        "server": {
            "name": router.server().name,
            "version": router.server().version,
            "uptime": router.uptime().as_secs_f64(),
        },
        "network": {
            "listenAddr": state.config.listen_addr.to_string(),
            "heartbeatSecs": state.config.heartbeat_interval.as_secs(),
            "idleTimeoutSecs": state.config.idle_timeout.as_secs(),
        },
        "devices": devices,
        "webClients": viewers,
        "cachedDevices": router.cache().len(),
        "timestamp": rfc3339(Utc::now()),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ApiError::Unavailable("metrics recorder not installed").into_response(),
    }
}

async fn proxy_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let client = state
        .device_api
        .as_ref()
        .ok_or(ApiError::NotFound("device api passthrough disabled"))?;
    let reachable = client.probe().await;
    let router = &state.router;
    Ok(Json(json!({
        "status": "online",
        "timestamp": rfc3339(Utc::now()),
        "clients": router.registry().viewer_count(),
        "devices": router.registry().device_count(),
        "uptime": router.uptime().as_secs_f64(),
        "deviceApi": {
            "url": client.base_url().as_str(),
            "reachable": reachable,
        },
    })))
}

async fn device_passthrough(
    State(state): State<AppState>,
    method: Method,
    Path(endpoint): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let client = state
        .device_api
        .as_ref()
        .ok_or(ApiError::NotFound("device api passthrough disabled"))?;
    let body = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice::<Value>(&body)
                .map_err(|err| ApiError::BadRequest(format!("invalid JSON body: {err}")))?,
        )
    };
    let upstream = tokio::time::timeout(client.deadline(), client.forward(method, &endpoint, body))
        .await
        .map_err(|_| DeviceApiError::Timeout)??;
    Ok((upstream.status, Json(upstream.body)).into_response())
}
