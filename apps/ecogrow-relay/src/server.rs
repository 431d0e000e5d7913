use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::handlers::{build_router, AppState};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let mut identity = config.server.clone();
    identity.listen_addr = listener.local_addr().ok().or(identity.listen_addr);
    let router = MessageRouter::new(ConnectionRegistry::new(), identity);
    let grace = config.shutdown_grace;
    let state = AppState::new(router, config, metrics).context("failed to build device api client")?;

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Serve until `shutdown` resolves, then drain every session.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("listener has no local address")?;
    let config = state.config.clone();
    let router = state.router.clone();

    let recycler = router.spawn_recycler(config.recycle_interval(), config.idle_timeout);

    let _advertiser = advertise(&config, local_addr.port());

    info!(
        listen_addr = %local_addr,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        device_api = config.device_api.as_ref().map(|api| api.base_url.as_str()),
        "ecogrow relay listening"
    );

    let app = build_router(state);
    let draining = router.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        draining.drain();
    })
    .await
    .context("server shutdown with error")?;

    recycler.abort();
    Ok(())
}

#[cfg(feature = "mdns")]
fn advertise(config: &RelayConfig, port: u16) -> Option<crate::discovery::RelayAdvertiser> {
    if !config.advertise_mdns {
        return None;
    }
    crate::discovery::RelayAdvertiser::advertise(&config.server.name, port, &config.server.version)
        .map_err(|err| warn!(error = %err, "mdns advertisement unavailable"))
        .ok()
}

#[cfg(not(feature = "mdns"))]
fn advertise(config: &RelayConfig, _port: u16) -> Option<()> {
    if config.advertise_mdns {
        warn!("mdns advertisement requested but the `mdns` feature is disabled");
    }
    None
}

pub async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
