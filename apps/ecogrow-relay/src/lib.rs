pub mod cache;
pub mod cli;
pub mod config;
pub mod device_api;
#[cfg(feature = "mdns")]
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod websocket;
