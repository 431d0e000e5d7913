//! Shared protocol definitions for relay ↔ controller ↔ dashboard communication.
//! Keeping the envelopes in a dedicated crate lets the bundled clients and any
//! future firmware tooling depend on the shapes without the relay runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Free-form telemetry pushed by a controller. The relay never imposes a schema.
pub type Telemetry = serde_json::Map<String, serde_json::Value>;

/// Identifier a controller presents when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidDeviceId {
    #[error("device id is empty")]
    Empty,
    #[error("device id is {0} characters long (max {max})", max = DeviceId::MAX_LEN)]
    TooLong(usize),
    #[error("device id contains invalid character {0:?}")]
    InvalidChar(char),
}

impl DeviceId {
    pub const MAX_LEN: usize = 64;

    pub fn parse(raw: &str) -> Result<Self, InvalidDeviceId> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidDeviceId::Empty);
        }
        let len = trimmed.chars().count();
        if len > Self::MAX_LEN {
            return Err(InvalidDeviceId::TooLong(len));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(InvalidDeviceId::InvalidChar(bad));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DeviceId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Role a websocket client announces through the `type` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    Device,
    Viewer,
}

impl ClientRole {
    /// Controllers in the field still announce themselves as `esp8266`;
    /// anything unrecognised is treated as a dashboard viewer.
    pub fn from_query(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "device" || value == "esp8266" => ClientRole::Device,
            _ => ClientRole::Viewer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClientRole::Device => "device",
            ClientRole::Viewer => "viewer",
        }
    }
}

/// Messages sent from a dashboard viewer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// Instruction for exactly one controller.
    Command {
        device: DeviceId,
        command: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    /// Application-level keep-alive for browsers that cannot see websocket pings.
    Ping,
}

/// Messages sent from the relay to a dashboard viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// First frame on every viewer connection.
    Welcome {
        message: String,
        server: String,
        version: String,
        devices: Vec<DeviceId>,
        /// Address the relay is bound to; absent when bound to every interface.
        #[serde(rename = "localIP", default, skip_serializing_if = "Option::is_none")]
        local_ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// Cached snapshot delivered right after the welcome frame.
    Init { device: DeviceId, data: Telemetry },
    /// Live telemetry from a controller.
    Data { device: DeviceId, data: Telemetry },
    /// Command accepted by the relay and handed to the controller's session.
    Ack { device: DeviceId, command: String },
    Error {
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<DeviceId>,
        message: String,
    },
    DeviceOnline { device: DeviceId },
    DeviceOffline { device: DeviceId },
    Pong,
}

/// Messages sent from the relay to a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Welcome {
        message: String,
        server: String,
        version: String,
        time: DateTime<Utc>,
    },
    Command {
        command: String,
        value: serde_json::Value,
        /// Milliseconds since the unix epoch at which the relay issued the command.
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DeviceOffline,
    MalformedMessage,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DeviceOffline => "device_offline",
            ErrorCode::MalformedMessage => "malformed_message",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Parse a controller frame. Anything that is not a JSON object is rejected.
pub fn parse_telemetry(text: &str) -> Result<Telemetry, serde_json::Error> {
    serde_json::from_str(text)
}

/// Controllers may send `{"type":"ping"}` to keep NAT bindings warm; such frames
/// carry no telemetry.
pub fn is_keepalive(payload: &Telemetry) -> bool {
    matches!(
        payload.get("type").and_then(|value| value.as_str()),
        Some("ping") | Some("pong")
    )
}
