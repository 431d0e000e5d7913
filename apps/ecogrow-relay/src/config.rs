use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;
use url::Url;

use crate::router::ServerIdentity;

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "ECOGROW_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Interval between keep-alive pings on every socket.
    #[arg(long, env = "ECOGROW_HEARTBEAT_SECS", default_value_t = 15)]
    pub heartbeat_secs: u64,

    /// Devices silent for longer than this are evicted.
    #[arg(long, env = "ECOGROW_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    /// Frames buffered per connection before new frames are dropped.
    #[arg(long, env = "ECOGROW_OUTBOX_DEPTH", default_value_t = 256)]
    pub outbox_depth: usize,

    /// Upper bound on any polling API request.
    #[arg(long, env = "ECOGROW_HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,

    /// Base URL of the controller's own HTTP API; enables the passthrough routes.
    #[arg(long, env = "ECOGROW_DEVICE_API_URL")]
    pub device_api_url: Option<String>,

    #[arg(long, env = "ECOGROW_DEVICE_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    pub device_probe_timeout_secs: u64,

    #[arg(long, env = "ECOGROW_DEVICE_FORWARD_TIMEOUT_SECS", default_value_t = 10)]
    pub device_forward_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "ECOGROW_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Advertise the relay over mDNS (requires the `mdns` feature).
    #[arg(long, env = "ECOGROW_ADVERTISE_MDNS", default_value_t = false)]
    pub advertise_mdns: bool,

    /// Name reported in welcome frames and the status endpoint.
    #[arg(long, env = "ECOGROW_SERVER_NAME", default_value = "EcoGrow Relay")]
    pub server_name: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub outbox_depth: usize,
    pub http_timeout: Duration,
    pub device_api: Option<DeviceApiConfig>,
    pub shutdown_grace: Duration,
    pub advertise_mdns: bool,
    pub server: ServerIdentity,
}

#[derive(Debug, Clone)]
pub struct DeviceApiConfig {
    pub base_url: Url,
    pub probe_timeout: Duration,
    pub forward_timeout: Duration,
}

impl RelayConfig {
    /// How often the recycler looks for idle devices.
    pub fn recycle_interval(&self) -> Duration {
        (self.idle_timeout / 3).clamp(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(90),
            outbox_depth: 256,
            http_timeout: Duration::from_secs(10),
            device_api: None,
            shutdown_grace: Duration::from_secs(5),
            advertise_mdns: false,
            server: ServerIdentity::default(),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.heartbeat_secs == 0 {
            bail!("heartbeat interval must be at least one second");
        }
        if args.idle_timeout_secs <= args.heartbeat_secs {
            bail!(
                "idle timeout ({}s) must exceed the heartbeat interval ({}s)",
                args.idle_timeout_secs,
                args.heartbeat_secs
            );
        }
        if args.outbox_depth == 0 {
            bail!("outbox depth must be positive");
        }
        if args.http_timeout_secs == 0 {
            bail!("http timeout must be at least one second");
        }

        let device_api = args
            .device_api_url
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| {
                let normalized = normalize_base_url(raw);
                Url::parse(&normalized)
                    .with_context(|| format!("invalid device api url: {raw}"))
                    .map(|base_url| DeviceApiConfig {
                        base_url,
                        probe_timeout: Duration::from_secs(args.device_probe_timeout_secs.max(1)),
                        forward_timeout: Duration::from_secs(
                            args.device_forward_timeout_secs.max(1),
                        ),
                    })
            })
            .transpose()?;

        Ok(RelayConfig {
            listen_addr,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            outbox_depth: args.outbox_depth,
            http_timeout: Duration::from_secs(args.http_timeout_secs),
            device_api,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            advertise_mdns: args.advertise_mdns,
            server: ServerIdentity {
                name: args.server_name,
                version: env!("CARGO_PKG_VERSION").to_string(),
                listen_addr: Some(listen_addr),
            },
        })
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        format!("{trimmed}/")
    } else {
        format!("http://{trimmed}/")
    }
}
