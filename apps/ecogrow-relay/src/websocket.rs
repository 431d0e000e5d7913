use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ecogrow_proto::{ClientRole, DeviceId};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::handlers::AppState;
use crate::session::{DeviceSession, Subscription, ViewerSession};
use crate::telemetry;
use crate::transport::{spawn_writer, Outbox};

pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Extra viewer queue slots for snapshots cached while the greeting is sent.
const BURST_HEADROOM: usize = 16;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "type")]
    pub role: Option<String>,
    pub device: Option<String>,
}

enum Handshake {
    Device(DeviceId),
    Viewer(Subscription),
}

fn resolve_handshake(query: &ConnectQuery, headers: &HeaderMap) -> Result<Handshake, RelayError> {
    let requested = query.device.as_deref().or_else(|| {
        headers
            .get(DEVICE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
    });
    match ClientRole::from_query(query.role.as_deref()) {
        ClientRole::Device => {
            let raw = requested.ok_or_else(|| {
                RelayError::HandshakeRejected("device connections require a device id".into())
            })?;
            Ok(Handshake::Device(DeviceId::parse(raw)?))
        }
        ClientRole::Viewer => match requested {
            Some(raw) => Ok(Handshake::Viewer(Subscription::Device(DeviceId::parse(raw)?))),
            None => Ok(Handshake::Viewer(Subscription::All)),
        },
    }
}

pub async fn websocket_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let Some(ws) = ws else {
        let server = state.router.server();
        return Json(json!({
            "server": server.name,
            "version": server.version,
            "webSocket": "/ws",
            "status": "/api/status",
        }))
        .into_response();
    };
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    match resolve_handshake(&query, &headers) {
        Ok(Handshake::Device(device_id)) => {
            ws.on_upgrade(move |socket| run_device(socket, state, device_id, remote_addr))
        }
        Ok(Handshake::Viewer(subscription)) => {
            ws.on_upgrade(move |socket| run_viewer(socket, state, subscription, remote_addr))
        }
        Err(err) => {
            warn!(remote_addr = ?remote_addr, error = %err, "rejecting websocket handshake");
            telemetry::record_handshake_rejected(err.metric_label());
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn run_device(
    socket: WebSocket,
    state: AppState,
    device_id: DeviceId,
    remote_addr: Option<SocketAddr>,
) {
    let router = state.router.clone();
    let (sink, mut stream) = socket.split();
    let (outbox, frames) = Outbox::channel(state.config.outbox_depth);
    let session = Arc::new(DeviceSession::new(device_id, outbox, remote_addr));
    let closed = session.closed();
    let writer = spawn_writer(
        sink,
        frames,
        closed.clone(),
        state.config.heartbeat_interval,
        format!("device:{}:{}", session.id(), session.connection_id()),
    );

    router.attach_device(session.clone());

    let reason = loop {
        tokio::select! {
            _ = closed.cancelled() => break "closed_by_relay",
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = router.handle_device_text(&session, &text) {
                        debug!(device_id = %session.id(), error = %err, "ignoring device frame");
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if let Err(err) = router.handle_device_text(&session, &text) {
                            debug!(device_id = %session.id(), error = %err, "ignoring device frame");
                        }
                    }
                    Err(_) => {
                        session.touch();
                        telemetry::record_malformed("device");
                        debug!(device_id = %session.id(), "ignoring non-utf8 binary frame");
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Close(_))) | None => break "peer_closed",
                Some(Err(err)) => {
                    debug!(device_id = %session.id(), error = %err, "device socket error");
                    break "transport_error";
                }
            }
        }
    };

    router.detach_device(&session, reason);
    let _ = writer.await;
}

/// Room for the whole greeting burst plus the configured live-traffic depth.
fn viewer_outbox_depth(configured: usize, initial_burst: usize) -> usize {
    configured.max(initial_burst.saturating_add(BURST_HEADROOM))
}

async fn run_viewer(
    socket: WebSocket,
    state: AppState,
    subscription: Subscription,
    remote_addr: Option<SocketAddr>,
) {
    let router = state.router.clone();
    let (sink, mut stream) = socket.split();
    let depth = viewer_outbox_depth(state.config.outbox_depth, router.initial_burst_len());
    let (outbox, frames) = Outbox::channel(depth);
    let viewer = Arc::new(ViewerSession::new(outbox, subscription, remote_addr));
    let closed = viewer.closed();
    let writer = spawn_writer(
        sink,
        frames,
        closed.clone(),
        state.config.heartbeat_interval,
        format!("viewer:{}", viewer.id()),
    );

    router.attach_viewer(viewer.clone());

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => router.handle_viewer_text(&viewer, &text),
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes);
                    router.handle_viewer_text(&viewer, &text);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(viewer_id = %viewer.id(), error = %err, "viewer socket error");
                    break;
                }
            }
        }
    }

    router.detach_viewer(viewer.id());
    let _ = writer.await;
}
