use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::FanoutReport;

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        init_tracing()?;

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

/// Tracing without a metrics recorder, used by the bundled clients.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")
}

pub fn record_device_connected(superseded: bool, online: usize) {
    counter!("ecogrow_relay_device_connections_total").increment(1);
    if superseded {
        counter!("ecogrow_relay_device_supersessions_total").increment(1);
    }
    gauge!("ecogrow_relay_devices_online").set(online as f64);
}

pub fn record_device_disconnected(reason: &'static str, online: usize) {
    counter!("ecogrow_relay_device_disconnects_total", "reason" => reason).increment(1);
    gauge!("ecogrow_relay_devices_online").set(online as f64);
}

pub fn record_viewers(active: usize) {
    gauge!("ecogrow_relay_viewers_active").set(active as f64);
}

/// No per-device label: device ids are client-chosen and never evicted.
pub fn record_fanout(report: &FanoutReport) {
    counter!("ecogrow_relay_telemetry_received_total").increment(1);
    if report.delivered > 0 {
        counter!("ecogrow_relay_telemetry_delivered_total").increment(report.delivered as u64);
    }
    if report.dropped > 0 {
        counter!("ecogrow_relay_flow_control_drops_total", "stage" => "fanout")
            .increment(report.dropped as u64);
    }
}

pub fn record_init_dropped(dropped: usize) {
    counter!("ecogrow_relay_flow_control_drops_total", "stage" => "init").increment(dropped as u64);
}

pub fn record_command(outcome: &'static str) {
    counter!("ecogrow_relay_commands_total", "outcome" => outcome).increment(1);
}

pub fn record_malformed(role: &'static str) {
    counter!("ecogrow_relay_malformed_messages_total", "role" => role).increment(1);
}

pub fn record_handshake_rejected(reason: &'static str) {
    counter!("ecogrow_relay_handshakes_rejected_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn recorder() -> &'static PrometheusHandle {
        static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
        HANDLE.get_or_init(|| PrometheusBuilder::new().install_recorder().unwrap())
    }

    #[test]
    fn fanout_counters_carry_no_device_label() {
        let handle = recorder();
        record_fanout(&FanoutReport {
            delivered: 3,
            dropped: 1,
            closed: 0,
        });
        record_init_dropped(2);

        let rendered = handle.render();
        assert!(rendered.contains("ecogrow_relay_telemetry_received_total"));
        assert!(rendered.contains("ecogrow_relay_telemetry_delivered_total"));
        assert!(rendered.contains(r#"ecogrow_relay_flow_control_drops_total{stage="fanout"}"#));
        assert!(rendered.contains(r#"ecogrow_relay_flow_control_drops_total{stage="init"}"#));
        assert!(!rendered.contains("device_id"));
    }
}
