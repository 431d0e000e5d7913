//! Message routing between controllers and viewers.
//!
//! Telemetry from a controller updates the [`StateCache`] and fans out to every
//! subscribed viewer. Commands from a viewer (or the polling API) go to exactly
//! one controller, or fail immediately; nothing is ever queued for later.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ecogrow_proto::{
    is_keepalive, parse_telemetry, DeviceId, DeviceMessage, ErrorCode, RelayMessage, Telemetry,
    ViewerMessage,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{StateCache, TelemetrySnapshot};
use crate::error::{RelayError, TransportError};
use crate::registry::ConnectionRegistry;
use crate::session::{DeviceSession, SessionState, ViewerSession};
use crate::telemetry;
use crate::transport::{CLOSE_GOING_AWAY, CLOSE_POLICY};

#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
    /// Bound listener address, announced to viewers in the welcome frame.
    pub listen_addr: Option<SocketAddr>,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: "EcoGrow Relay".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: None,
        }
    }
}

impl ServerIdentity {
    /// IP worth showing to a dashboard; a wildcard bind has none.
    fn local_ip(&self) -> Option<String> {
        self.listen_addr
            .map(|addr| addr.ip())
            .filter(|ip| !ip.is_unspecified())
            .map(|ip| ip.to_string())
    }
}

/// Viewer-originated instruction for one controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target: DeviceId,
    pub name: String,
    pub value: Value,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(target: DeviceId, name: impl Into<String>, value: Value) -> Self {
        Self {
            target,
            name: name.into(),
            value,
            issued_at: Utc::now(),
        }
    }
}

/// Outcome of delivering one telemetry frame to the viewer set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    registry: ConnectionRegistry,
    cache: StateCache,
    // Held across cache update + fan-out and across viewer join, so a joining
    // viewer gets each telemetry frame exactly once. Lock order: fanout_gate,
    // then registry, then cache.
    fanout_gate: Mutex<()>,
    server: ServerIdentity,
    started_at: Instant,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry, server: ServerIdentity) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                cache: StateCache::new(),
                fanout_gate: Mutex::new(()),
                server,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.inner.server
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Register a freshly handshaken controller, greet it and tell viewers.
    pub fn attach_device(&self, session: Arc<DeviceSession>) {
        let registry = self.registry();
        let superseded = registry.register_device(session.clone());
        if let Some(previous) = &superseded {
            info!(
                device_id = %session.id(),
                previous_connection = %previous.connection_id(),
                connection_id = %session.connection_id(),
                "device connection superseded"
            );
        } else {
            info!(
                device_id = %session.id(),
                connection_id = %session.connection_id(),
                remote_addr = ?session.remote_addr(),
                "device connected"
            );
        }
        telemetry::record_device_connected(superseded.is_some(), registry.device_count());

        let welcome = DeviceMessage::Welcome {
            message: "Connected to relay".to_string(),
            server: self.inner.server.name.clone(),
            version: self.inner.server.version.clone(),
            time: Utc::now(),
        };
        let _ = session.send(&welcome);

        if superseded.is_none() {
            self.broadcast_presence(RelayMessage::DeviceOnline {
                device: session.id().clone(),
            });
        }
    }

    /// Called once the controller's transport has closed for any reason.
    /// Idempotent; a superseded session leaves its successor untouched.
    pub fn detach_device(&self, session: &DeviceSession, reason: &'static str) {
        session.close(CLOSE_GOING_AWAY, "connection closed");
        if self.registry().unregister_device(session) {
            info!(
                device_id = %session.id(),
                connection_id = %session.connection_id(),
                reason,
                "device disconnected"
            );
            telemetry::record_device_disconnected(reason, self.registry().device_count());
            self.broadcast_presence(RelayMessage::DeviceOffline {
                device: session.id().clone(),
            });
        } else {
            debug!(
                device_id = %session.id(),
                connection_id = %session.connection_id(),
                "closed session was no longer registered"
            );
        }
    }

    /// Handle one text frame from a controller. Malformed frames are reported
    /// to the caller and otherwise ignored; the connection stays open.
    pub fn handle_device_text(
        &self,
        session: &DeviceSession,
        text: &str,
    ) -> Result<FanoutReport, RelayError> {
        if session.state() == SessionState::Closed {
            return Ok(FanoutReport::default());
        }
        session.touch();
        let payload = parse_telemetry(text).map_err(|err| {
            telemetry::record_malformed("device");
            RelayError::MalformedMessage(err.to_string())
        })?;
        if is_keepalive(&payload) {
            return Ok(FanoutReport::default());
        }
        Ok(self.publish_telemetry(session.id(), payload, session.remote_ip()))
    }

    /// Update the cache and deliver `{type:data}` to every matching viewer.
    /// Delivery is best-effort: a full or closed viewer queue is skipped.
    pub fn publish_telemetry(
        &self,
        device: &DeviceId,
        payload: Telemetry,
        source_ip: Option<IpAddr>,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        let message = RelayMessage::Data {
            device: device.clone(),
            data: payload.clone(),
        };
        let encoded = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                warn!(device_id = %device, error = %err, "failed to encode telemetry");
                return report;
            }
        };

        let gate = self.inner.fanout_gate.lock();
        self.cache()
            .put(TelemetrySnapshot::new(device.clone(), payload, source_ip));

        for viewer in self.registry().all_viewers() {
            if !viewer.subscription().matches(device) {
                continue;
            }
            match viewer.send_text(encoded.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TransportError::Backpressure) => {
                    report.dropped += 1;
                    debug!(viewer_id = %viewer.id(), device_id = %device, "viewer queue full; frame dropped");
                }
                Err(_) => report.closed += 1,
            }
        }
        drop(gate);

        telemetry::record_fanout(&report);
        report
    }

    /// Register a viewer and immediately send it the welcome frame plus one
    /// `init` per cached snapshot it is subscribed to.
    ///
    /// Returns how many `init` frames did not fit in the viewer's outbox; size
    /// the outbox with [`MessageRouter::initial_burst_len`] to keep it at zero.
    pub fn attach_viewer(&self, viewer: Arc<ViewerSession>) -> usize {
        let gate = self.inner.fanout_gate.lock();

        let welcome = RelayMessage::Welcome {
            message: format!("Connected to {}", self.inner.server.name),
            server: self.inner.server.name.clone(),
            version: self.inner.server.version.clone(),
            devices: self.registry().device_ids(),
            local_ip: self.inner.server.local_ip(),
            port: self.inner.server.listen_addr.map(|addr| addr.port()),
        };
        if let Err(err) = viewer.send(&welcome) {
            warn!(viewer_id = %viewer.id(), error = %err, "failed to greet viewer");
        }
        let mut dropped_inits = 0;
        for snapshot in self.cache().get_all() {
            if !viewer.subscription().matches(&snapshot.device_id) {
                continue;
            }
            let init = RelayMessage::Init {
                device: snapshot.device_id,
                data: snapshot.payload,
            };
            match viewer.send(&init) {
                Ok(()) => {}
                Err(TransportError::Backpressure) => dropped_inits += 1,
                Err(err) => {
                    warn!(viewer_id = %viewer.id(), error = %err, "failed to deliver cached snapshot");
                    break;
                }
            }
        }
        if dropped_inits > 0 {
            warn!(
                viewer_id = %viewer.id(),
                dropped_inits,
                "viewer outbox too small for the cached snapshots"
            );
            telemetry::record_init_dropped(dropped_inits);
        }

        self.registry().register_viewer(viewer.clone());
        drop(gate);

        info!(
            viewer_id = %viewer.id(),
            subscription = ?viewer.subscription(),
            remote_addr = ?viewer.remote_addr(),
            "viewer connected"
        );
        telemetry::record_viewers(self.registry().viewer_count());
        dropped_inits
    }

    /// Frames a newly attached viewer receives before any live traffic: the
    /// welcome plus one `init` per cached device.
    pub fn initial_burst_len(&self) -> usize {
        self.cache().len() + 1
    }

    pub fn detach_viewer(&self, viewer_id: Uuid) {
        if let Some(viewer) = self.registry().unregister_viewer(viewer_id) {
            viewer.close(CLOSE_GOING_AWAY, "connection closed");
            info!(viewer_id = %viewer_id, "viewer disconnected");
            telemetry::record_viewers(self.registry().viewer_count());
        }
    }

    /// Handle one text frame from a viewer; every outcome is answered on the
    /// viewer's own connection.
    pub fn handle_viewer_text(&self, viewer: &ViewerSession, text: &str) {
        let reply = match serde_json::from_str::<ViewerMessage>(text) {
            Ok(ViewerMessage::Command {
                device,
                command,
                value,
            }) => {
                let command = Command::new(device, command, value);
                let device = command.target.clone();
                let name = command.name.clone();
                match self.dispatch_command(command) {
                    Ok(()) => RelayMessage::Ack {
                        device,
                        command: name,
                    },
                    Err(err) => RelayMessage::Error {
                        code: err.code(),
                        device: Some(device),
                        message: err.to_string(),
                    },
                }
            }
            Ok(ViewerMessage::Ping) => RelayMessage::Pong,
            Err(err) => {
                telemetry::record_malformed("viewer");
                debug!(viewer_id = %viewer.id(), error = %err, "malformed viewer frame");
                RelayMessage::Error {
                    code: ErrorCode::MalformedMessage,
                    device: None,
                    message: format!("invalid message: {err}"),
                }
            }
        };
        if let Err(err) = viewer.send(&reply) {
            debug!(viewer_id = %viewer.id(), error = %err, "failed to answer viewer");
        }
    }

    /// Route a command to its controller. At-most-once: an offline target fails
    /// immediately and the command is discarded.
    pub fn dispatch_command(&self, command: Command) -> Result<(), RelayError> {
        let Some(session) = self.registry().lookup_device(command.target.as_str()) else {
            let err = if self.cache().contains(command.target.as_str()) {
                RelayError::DeviceOffline(command.target)
            } else {
                RelayError::DeviceNotFound(command.target)
            };
            telemetry::record_command(err.metric_label());
            return Err(err);
        };
        if !session.is_online() {
            telemetry::record_command("device_offline");
            return Err(RelayError::DeviceOffline(command.target));
        }

        let outbound = DeviceMessage::Command {
            command: command.name.clone(),
            value: command.value,
            timestamp: command.issued_at.timestamp_millis(),
        };
        match session.send(&outbound) {
            Ok(()) => {
                info!(device_id = %command.target, command = %command.name, "command forwarded");
                telemetry::record_command("forwarded");
                Ok(())
            }
            Err(err) => {
                telemetry::record_command(err.metric_label());
                Err(RelayError::DeviceOffline(command.target))
            }
        }
    }

    /// Close controllers that have been silent for longer than `idle_timeout`.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let idle = self.registry().idle_devices(idle_timeout);
        for session in &idle {
            warn!(
                device_id = %session.id(),
                idle_secs = session.idle_for(Utc::now()).as_secs(),
                "evicting idle device"
            );
            session.close(CLOSE_POLICY, "idle timeout");
            self.detach_device(session, "idle_timeout");
        }
        idle.len()
    }

    pub fn spawn_recycler(&self, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let router = self.clone();
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                router.evict_idle(idle_timeout);
            }
        })
    }

    /// Graceful shutdown: stop accepting commands, then close every socket.
    pub fn drain(&self) {
        let devices = self.registry().all_devices();
        for session in &devices {
            session.begin_drain();
        }
        for session in &devices {
            session.close(CLOSE_GOING_AWAY, "server shutting down");
        }
        for viewer in self.registry().all_viewers() {
            viewer.close(CLOSE_GOING_AWAY, "server shutting down");
        }
        info!(devices = devices.len(), "relay drained");
    }

    fn broadcast_presence(&self, message: RelayMessage) {
        for viewer in self.registry().all_viewers() {
            let _ = viewer.send(&message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Subscription;
    use crate::transport::{Frame, Outbox};
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    fn router() -> MessageRouter {
        MessageRouter::new(ConnectionRegistry::new(), ServerIdentity::default())
    }

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    fn connect_device(router: &MessageRouter, raw: &str) -> (Arc<DeviceSession>, Receiver<Frame>) {
        let (outbox, rx) = Outbox::channel(32);
        let session = Arc::new(DeviceSession::new(id(raw), outbox, None));
        router.attach_device(session.clone());
        (session, rx)
    }

    fn connect_viewer(
        router: &MessageRouter,
        subscription: Subscription,
    ) -> (Arc<ViewerSession>, Receiver<Frame>) {
        let (outbox, rx) = Outbox::channel(32);
        let viewer = Arc::new(ViewerSession::new(outbox, subscription, None));
        router.attach_viewer(viewer.clone());
        (viewer, rx)
    }

    fn drain_json(rx: &mut Receiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
        frames.iter().filter(|f| f["type"] == kind).collect()
    }

    #[test]
    fn device_is_greeted_on_attach() {
        let router = router();
        let (_session, mut rx) = connect_device(&router, "pump-1");
        let frames = drain_json(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "welcome");
        assert_eq!(frames[0]["server"], "EcoGrow Relay");
    }

    #[test]
    fn viewer_welcome_announces_the_listen_address() {
        let bound = MessageRouter::new(
            ConnectionRegistry::new(),
            ServerIdentity {
                listen_addr: Some("192.168.0.10:8080".parse().unwrap()),
                ..ServerIdentity::default()
            },
        );
        let (_viewer, mut rx) = connect_viewer(&bound, Subscription::All);
        let welcome = &drain_json(&mut rx)[0];
        assert_eq!(welcome["localIP"], "192.168.0.10");
        assert_eq!(welcome["port"], 8080);

        let wildcard = MessageRouter::new(
            ConnectionRegistry::new(),
            ServerIdentity {
                listen_addr: Some("0.0.0.0:8080".parse().unwrap()),
                ..ServerIdentity::default()
            },
        );
        let (_viewer, mut rx) = connect_viewer(&wildcard, Subscription::All);
        let welcome = &drain_json(&mut rx)[0];
        assert!(welcome.get("localIP").is_none());
        assert_eq!(welcome["port"], 8080);
    }

    #[test]
    fn telemetry_reaches_viewers_in_order() {
        let router = router();
        let (device, _device_rx) = connect_device(&router, "pump-1");
        let (_viewer, mut viewer_rx) = connect_viewer(&router, Subscription::All);
        drain_json(&mut viewer_rx);

        for moisture in 0..20 {
            router
                .handle_device_text(&device, &json!({ "moisture": moisture }).to_string())
                .unwrap();
        }

        let frames = drain_json(&mut viewer_rx);
        let values: Vec<i64> = of_type(&frames, "data")
            .iter()
            .map(|f| f["data"]["moisture"].as_i64().unwrap())
            .collect();
        assert_eq!(values, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn late_viewer_receives_cached_snapshot() {
        let router = router();
        let (device, _device_rx) = connect_device(&router, "pump-1");
        router
            .handle_device_text(&device, r#"{"moisture": 42, "pump": false}"#)
            .unwrap();

        let (_viewer, mut rx) = connect_viewer(&router, Subscription::All);
        let frames = drain_json(&mut rx);
        assert_eq!(frames[0]["type"], "welcome");
        assert_eq!(frames[0]["devices"], json!(["pump-1"]));
        let init = of_type(&frames, "init");
        assert_eq!(init.len(), 1);
        assert_eq!(init[0]["device"], "pump-1");
        assert_eq!(init[0]["data"], json!({"moisture": 42, "pump": false}));
    }

    #[test]
    fn subscribed_viewer_only_sees_its_device() {
        let router = router();
        let (pump, _a) = connect_device(&router, "pump-1");
        let (light, _b) = connect_device(&router, "light-1");
        router.handle_device_text(&pump, r#"{"moisture": 1}"#).unwrap();
        router.handle_device_text(&light, r#"{"lux": 2}"#).unwrap();

        let (_viewer, mut rx) = connect_viewer(&router, Subscription::Device(id("light-1")));
        let frames = drain_json(&mut rx);
        let init = of_type(&frames, "init");
        assert_eq!(init.len(), 1);
        assert_eq!(init[0]["device"], "light-1");

        router.handle_device_text(&pump, r#"{"moisture": 3}"#).unwrap();
        router.handle_device_text(&light, r#"{"lux": 4}"#).unwrap();
        let frames = drain_json(&mut rx);
        let data = of_type(&frames, "data");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["data"]["lux"], 4);
    }

    #[test]
    fn malformed_device_frame_is_dropped() {
        let router = router();
        let (device, _rx) = connect_device(&router, "pump-1");
        let (_viewer, mut viewer_rx) = connect_viewer(&router, Subscription::All);
        drain_json(&mut viewer_rx);

        assert!(matches!(
            router.handle_device_text(&device, "not json"),
            Err(RelayError::MalformedMessage(_))
        ));
        assert!(matches!(
            router.handle_device_text(&device, "[1, 2]"),
            Err(RelayError::MalformedMessage(_))
        ));
        assert!(drain_json(&mut viewer_rx).is_empty());
        assert!(router.cache().is_empty());
        assert!(device.is_online());
    }

    #[test]
    fn keepalive_frames_are_not_telemetry() {
        let router = router();
        let (device, _rx) = connect_device(&router, "pump-1");
        let report = router
            .handle_device_text(&device, r#"{"type":"ping"}"#)
            .unwrap();
        assert_eq!(report, FanoutReport::default());
        assert!(router.cache().is_empty());
    }

    #[test]
    fn broken_viewer_does_not_block_the_others() {
        let router = router();
        let (device, _device_rx) = connect_device(&router, "pump-1");
        let (_a, mut a_rx) = connect_viewer(&router, Subscription::All);
        let (_b, b_rx) = connect_viewer(&router, Subscription::All);
        let (_c, mut c_rx) = connect_viewer(&router, Subscription::All);
        drop(b_rx);
        drain_json(&mut a_rx);
        drain_json(&mut c_rx);

        let report = router
            .handle_device_text(&device, r#"{"moisture": 40}"#)
            .unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.closed, 1);
        assert_eq!(of_type(&drain_json(&mut a_rx), "data").len(), 1);
        assert_eq!(of_type(&drain_json(&mut c_rx), "data").len(), 1);
    }

    #[test]
    fn slow_viewer_drops_frames_without_blocking() {
        let router = router();
        let (device, _device_rx) = connect_device(&router, "pump-1");
        let (outbox, mut slow_rx) = Outbox::channel(1);
        let slow = Arc::new(ViewerSession::new(outbox, Subscription::All, None));
        router.attach_viewer(slow);
        let (_fast, mut fast_rx) = connect_viewer(&router, Subscription::All);
        drain_json(&mut fast_rx);

        let report = router
            .handle_device_text(&device, r#"{"moisture": 1}"#)
            .unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(of_type(&drain_json(&mut fast_rx), "data").len(), 1);
        // only the welcome frame fits
        assert_eq!(drain_json(&mut slow_rx).len(), 1);
    }

    #[test]
    fn small_outbox_counts_the_snapshots_it_cannot_hold() {
        let router = router();
        for raw in ["a-1", "b-1", "c-1", "d-1"] {
            let (device, _rx) = connect_device(&router, raw);
            router.handle_device_text(&device, r#"{"moisture": 1}"#).unwrap();
        }
        assert_eq!(router.initial_burst_len(), 5);

        let (outbox, mut rx) = Outbox::channel(3);
        let viewer = Arc::new(ViewerSession::new(outbox, Subscription::All, None));
        assert_eq!(router.attach_viewer(viewer), 2);
        let frames = drain_json(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(of_type(&frames, "init").len(), 2);
        assert_eq!(router.registry().viewer_count(), 1);

        let (outbox, mut rx) = Outbox::channel(router.initial_burst_len());
        let viewer = Arc::new(ViewerSession::new(outbox, Subscription::All, None));
        assert_eq!(router.attach_viewer(viewer), 0);
        assert_eq!(of_type(&drain_json(&mut rx), "init").len(), 4);
    }

    #[test]
    fn command_to_unknown_device_never_reaches_a_transport() {
        let router = router();
        let (_device, mut device_rx) = connect_device(&router, "pump-1");
        drain_json(&mut device_rx);
        let (viewer, mut viewer_rx) = connect_viewer(&router, Subscription::All);
        drain_json(&mut viewer_rx);

        router.handle_viewer_text(
            &viewer,
            r#"{"type":"command","device":"ghost","command":"pump","value":1}"#,
        );

        let frames = drain_json(&mut viewer_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["code"], "device_offline");
        assert_eq!(frames[0]["device"], "ghost");
        assert!(drain_json(&mut device_rx).is_empty());
    }

    #[test]
    fn dispatch_distinguishes_known_offline_from_unknown() {
        let router = router();
        let (device, _rx) = connect_device(&router, "pump-1");
        router.handle_device_text(&device, r#"{"moisture": 1}"#).unwrap();
        router.detach_device(&device, "closed");

        assert!(matches!(
            router.dispatch_command(Command::new(id("pump-1"), "pump", json!(1))),
            Err(RelayError::DeviceOffline(_))
        ));
        assert!(matches!(
            router.dispatch_command(Command::new(id("ghost"), "pump", json!(1))),
            Err(RelayError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn draining_device_rejects_commands() {
        let router = router();
        let (device, _rx) = connect_device(&router, "pump-1");
        device.begin_drain();
        assert!(matches!(
            router.dispatch_command(Command::new(id("pump-1"), "pump", json!(1))),
            Err(RelayError::DeviceOffline(_))
        ));
    }

    #[test]
    fn malformed_viewer_frame_gets_an_error_reply() {
        let router = router();
        let (viewer, mut rx) = connect_viewer(&router, Subscription::All);
        drain_json(&mut rx);
        router.handle_viewer_text(&viewer, r#"{"type":"dance"}"#);
        router.handle_viewer_text(&viewer, r#"{"type":"ping"}"#);
        let frames = drain_json(&mut rx);
        assert_eq!(frames[0]["code"], "malformed_message");
        assert_eq!(frames[1]["type"], "pong");
    }

    #[test]
    fn presence_is_broadcast_to_viewers() {
        let router = router();
        let (_viewer, mut rx) = connect_viewer(&router, Subscription::All);
        drain_json(&mut rx);
        let (device, _device_rx) = connect_device(&router, "pump-1");
        router.detach_device(&device, "closed");
        let frames = drain_json(&mut rx);
        assert_eq!(frames[0], json!({"type": "device_online", "device": "pump-1"}));
        assert_eq!(frames[1], json!({"type": "device_offline", "device": "pump-1"}));
    }

    #[test]
    fn superseded_session_close_keeps_successor_online() {
        let router = router();
        let (first, mut first_rx) = connect_device(&router, "pump-1");
        let (second, _second_rx) = connect_device(&router, "pump-1");
        assert!(drain_frames_contain_close(&mut first_rx));

        router.detach_device(&first, "closed");
        assert!(second.is_online());
        assert_eq!(router.registry().device_count(), 1);
        router
            .dispatch_command(Command::new(id("pump-1"), "pump", json!(1)))
            .unwrap();
    }

    fn drain_frames_contain_close(rx: &mut Receiver<Frame>) -> bool {
        let mut saw_close = false;
        while let Ok(frame) = rx.try_recv() {
            saw_close |= matches!(frame, Frame::Close { .. });
        }
        saw_close
    }

    #[test]
    fn idle_devices_are_evicted() {
        let router = router();
        let (device, _rx) = connect_device(&router, "pump-1");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(router.evict_idle(Duration::from_millis(5)), 1);
        assert_eq!(device.state(), SessionState::Closed);
        assert_eq!(router.registry().device_count(), 0);
    }

    #[test]
    fn drain_closes_everything() {
        let router = router();
        let (device, _rx) = connect_device(&router, "pump-1");
        let (viewer, _viewer_rx) = connect_viewer(&router, Subscription::All);
        router.drain();
        assert_eq!(device.state(), SessionState::Closed);
        assert!(viewer.closed().is_cancelled());
    }

    #[test]
    fn end_to_end_pump_scenario() {
        let router = router();
        let (device, mut device_rx) = connect_device(&router, "pump-1");
        drain_json(&mut device_rx);

        router.handle_device_text(&device, r#"{"moisture":42}"#).unwrap();

        let (viewer, mut viewer_rx) = connect_viewer(&router, Subscription::All);
        let frames = drain_json(&mut viewer_rx);
        let init = of_type(&frames, "init");
        assert_eq!(init[0]["data"], json!({"moisture": 42}));

        router.handle_device_text(&device, r#"{"moisture":40}"#).unwrap();
        let frames = drain_json(&mut viewer_rx);
        assert_eq!(
            frames,
            vec![json!({"type": "data", "device": "pump-1", "data": {"moisture": 40}})]
        );

        router.handle_viewer_text(
            &viewer,
            r#"{"device":"pump-1","type":"command","command":"pump","value":1}"#,
        );
        let to_device = drain_json(&mut device_rx);
        assert_eq!(to_device.len(), 1);
        assert_eq!(to_device[0]["type"], "command");
        assert_eq!(to_device[0]["command"], "pump");
        assert_eq!(to_device[0]["value"], 1);
        assert!(to_device[0]["timestamp"].as_i64().unwrap() > 0);

        let acks = drain_json(&mut viewer_rx);
        assert_eq!(acks, vec![json!({"type": "ack", "device": "pump-1", "command": "pump"})]);
    }
}
