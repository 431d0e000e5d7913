use ecogrow_proto::{DeviceId, ErrorCode, InvalidDeviceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("device {0} is offline")]
    DeviceOffline(DeviceId),
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
}

impl RelayError {
    /// Code reported to websocket viewers. An unknown device is indistinguishable
    /// from an offline one on that channel.
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            RelayError::DeviceOffline(_) | RelayError::DeviceNotFound(_) => {
                ErrorCode::DeviceOffline
            }
            RelayError::Transport(_) | RelayError::HandshakeRejected(_) => ErrorCode::Internal,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::MalformedMessage(_) => "malformed_message",
            RelayError::DeviceOffline(_) => "device_offline",
            RelayError::DeviceNotFound(_) => "device_not_found",
            RelayError::Transport(err) => err.metric_label(),
            RelayError::HandshakeRejected(_) => "handshake_rejected",
        }
    }
}

impl From<InvalidDeviceId> for RelayError {
    fn from(err: InvalidDeviceId) -> Self {
        RelayError::HandshakeRejected(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("outbound queue full")]
    Backpressure,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TransportError::Closed => "transport_closed",
            TransportError::Backpressure => "backpressure",
            TransportError::Encode(_) => "encode",
        }
    }
}
