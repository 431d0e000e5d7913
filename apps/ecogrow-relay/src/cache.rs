use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ecogrow_proto::{DeviceId, Telemetry};
use parking_lot::RwLock;
use serde_json::Value;

/// Most recent telemetry from one controller.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    pub device_id: DeviceId,
    pub payload: Telemetry,
    pub received_at: DateTime<Utc>,
    pub source_ip: Option<IpAddr>,
}

impl TelemetrySnapshot {
    pub fn new(device_id: DeviceId, payload: Telemetry, source_ip: Option<IpAddr>) -> Self {
        Self {
            device_id,
            payload,
            received_at: Utc::now(),
            source_ip,
        }
    }

    /// Payload with relay bookkeeping merged in, as served by the polling API.
    /// Relay fields win over same-named payload fields.
    pub fn annotated(&self) -> Telemetry {
        let mut data = self.payload.clone();
        data.insert(
            "timestamp".into(),
            Value::from(self.received_at.timestamp_millis()),
        );
        data.insert("deviceId".into(), Value::from(self.device_id.as_str()));
        if let Some(ip) = self.source_ip {
            data.insert("ip".into(), Value::from(ip.to_string()));
        }
        data
    }
}

/// Last-write-wins store of one snapshot per controller. No history, no expiry.
#[derive(Clone, Default)]
pub struct StateCache {
    inner: Arc<RwLock<HashMap<DeviceId, TelemetrySnapshot>>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<TelemetrySnapshot> {
        self.inner.read().get(device_id).cloned()
    }

    /// All snapshots ordered by device id.
    pub fn get_all(&self) -> Vec<TelemetrySnapshot> {
        let mut all: Vec<_> = self.inner.read().values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn put(&self, snapshot: TelemetrySnapshot) -> Option<TelemetrySnapshot> {
        self.inner
            .write()
            .insert(snapshot.device_id.clone(), snapshot)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.inner.read().contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
