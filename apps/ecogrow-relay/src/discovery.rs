//! Zeroconf advertisement so dashboards on the LAN can find the relay.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use thiserror::Error;
use tracing::{info, warn};

pub const SERVICE_TYPE: &str = "_http._tcp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns error: {0}")]
    Mdns(String),
    #[error("hostname lookup failed: {0}")]
    Hostname(String),
}

/// Keeps the relay registered on the local network until dropped.
pub struct RelayAdvertiser {
    mdns: ServiceDaemon,
    fullname: Option<String>,
}

impl RelayAdvertiser {
    pub fn advertise(instance: &str, port: u16, version: &str) -> Result<Self, DiscoveryError> {
        let mdns = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        let host = hostname::get().map_err(|e| DiscoveryError::Hostname(e.to_string()))?;
        let host = format!("{}.local.", host.to_string_lossy());

        let properties: &[(&str, &str)] = &[
            ("type", "ecogrow-relay"),
            ("version", version),
            ("ws", "/ws"),
            ("api", "/api"),
        ];
        let service_info = ServiceInfo::new(SERVICE_TYPE, instance, &host, "", port, properties)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?
            .enable_addr_auto();
        let fullname = service_info.get_fullname().to_string();

        mdns.register(service_info)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        info!(instance, port, service = SERVICE_TYPE, "advertising relay over mdns");

        Ok(Self {
            mdns,
            fullname: Some(fullname),
        })
    }

    pub fn stop(&mut self) -> Result<(), DiscoveryError> {
        if let Some(fullname) = self.fullname.take() {
            self.mdns
                .unregister(&fullname)
                .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for RelayAdvertiser {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to withdraw mdns advertisement");
        }
    }
}
