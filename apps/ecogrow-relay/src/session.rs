use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ecogrow_proto::{DeviceId, RelayMessage};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::{RelayError, TransportError};
use crate::transport::Outbox;

/// Lifecycle of a controller connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Online,
    Draining,
    Closed,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Online)
                | (Online, Draining)
                | (Connecting, Closed)
                | (Online, Closed)
                | (Draining, Closed)
        )
    }
}

/// One live controller connection.
#[derive(Debug)]
pub struct DeviceSession {
    id: DeviceId,
    connection_id: Uuid,
    outbox: Outbox,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    state: Mutex<SessionState>,
}

impl DeviceSession {
    pub fn new(id: DeviceId, outbox: Outbox, remote_addr: Option<SocketAddr>) -> Self {
        let now = Utc::now();
        Self {
            id,
            connection_id: Uuid::new_v4(),
            outbox,
            remote_addr,
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            state: Mutex::new(SessionState::Connecting),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr.map(|addr| addr.ip().to_canonical())
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_online(&self) -> bool {
        self.state() == SessionState::Online && !self.outbox.is_closed()
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_online(&self) -> bool {
        self.transition(SessionState::Online)
    }

    /// Stop accepting commands ahead of a forced close.
    pub fn begin_drain(&self) -> bool {
        self.transition(SessionState::Draining)
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        self.transition(SessionState::Closed);
        self.outbox.close(code, reason);
    }

    /// Cancelled once the transport is closed from either side.
    pub fn closed(&self) -> CancellationToken {
        self.outbox.closed_token()
    }

    /// Queue a message for the controller. Never blocks; a session that is not
    /// Online rejects the message.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), RelayError> {
        if self.state() != SessionState::Online {
            warn!(device_id = %self.id, state = ?self.state(), "dropping message for session that is not online");
            return Err(RelayError::DeviceOffline(self.id.clone()));
        }
        self.outbox.send(message).map_err(|err| {
            warn!(device_id = %self.id, error = %err, "failed to queue message for device");
            RelayError::Transport(err)
        })
    }
}

/// Which controllers a viewer wants telemetry for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "device")]
pub enum Subscription {
    All,
    Device(DeviceId),
}

impl Subscription {
    pub fn matches(&self, device: &DeviceId) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Device(id) => id == device,
        }
    }
}

/// One live dashboard connection.
#[derive(Debug)]
pub struct ViewerSession {
    id: Uuid,
    outbox: Outbox,
    subscription: Subscription,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
}

impl ViewerSession {
    pub fn new(outbox: Outbox, subscription: Subscription, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbox,
            subscription,
            remote_addr,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn send(&self, message: &RelayMessage) -> Result<(), TransportError> {
        self.outbox.send(message)
    }

    pub(crate) fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbox.send_text(text)
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        self.outbox.close(code, reason);
    }

    pub fn closed(&self) -> CancellationToken {
        self.outbox.closed_token()
    }
}
