//! Command line entry points and the bundled websocket clients.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use ecogrow_proto::{DeviceId, DeviceMessage, RelayMessage, ViewerMessage};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ServeArgs;
use crate::reconnect::Backoff;

#[derive(Parser, Debug)]
#[command(name = "ecogrow-relay", version)]
#[command(about = "EcoGrow relay server and debug clients")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve(ServeArgs),

    /// Connect as a fake controller and publish synthetic telemetry
    SimulateDevice {
        /// Relay URL (e.g. ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        #[arg(short, long, default_value = "pump-1")]
        device: String,

        /// Seconds between telemetry frames
        #[arg(short, long, default_value_t = 2)]
        interval_secs: u64,

        /// Stop after this many frames
        #[arg(short, long)]
        count: Option<u64>,
    },

    /// Connect as a viewer and print every frame as a JSON line
    Watch {
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Only receive telemetry for this device
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Send one command through the relay and wait for the acknowledgement
    Send {
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        #[arg(short, long)]
        device: String,

        command: String,

        /// JSON value; bare words are sent as strings
        #[arg(default_value = "null")]
        value: String,
    },
}

/// Websocket URL for a device or viewer connection.
pub fn connect_url(base: &str, role: &str, device: Option<&str>) -> Result<Url> {
    let trimmed = base.trim().trim_end_matches('/');
    let with_scheme = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme).with_context(|| format!("invalid relay url: {base}"))?;
    url.set_path("/ws");
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.append_pair("type", role);
        if let Some(device) = device {
            pairs.append_pair("device", device);
        }
    }
    Ok(url)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Mutable state of the simulated controller.
#[derive(Debug, Default)]
struct SimulatedPlant {
    pump: bool,
    light: bool,
    moisture: f64,
}

impl SimulatedPlant {
    fn sample(&mut self) -> Value {
        let mut rng = rand::thread_rng();
        if self.moisture == 0.0 {
            self.moisture = 55.0;
        }
        let drift = if self.pump { 1.5 } else { -0.5 };
        self.moisture = (self.moisture + drift + rng.gen_range(-0.3..0.3)).clamp(0.0, 100.0);
        json!({
            "moisture": (self.moisture * 10.0).round() / 10.0,
            "temperature": 22.0 + rng.gen_range(-1.5..1.5),
            "humidity": 60.0 + rng.gen_range(-5.0..5.0),
            "pump": self.pump,
            "light": self.light,
        })
    }

    fn apply(&mut self, command: &str, value: &Value) {
        let on = match value {
            Value::Bool(flag) => *flag,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            Value::String(s) => matches!(s.as_str(), "on" | "true" | "1"),
            _ => false,
        };
        match command {
            "pump" => self.pump = on,
            "light" => self.light = on,
            other => warn!(command = other, "simulator ignoring unknown command"),
        }
    }
}

pub async fn run_simulated_device(
    url: String,
    device: String,
    interval_secs: u64,
    count: Option<u64>,
) -> Result<()> {
    let device_id = DeviceId::parse(&device).map_err(|err| anyhow!("invalid device id: {err}"))?;
    let target = connect_url(&url, "device", Some(device_id.as_str()))?;
    let mut plant = SimulatedPlant::default();
    let mut backoff = Backoff::default();
    let mut sent = 0u64;

    loop {
        let stream = match timeout(Duration::from_secs(5), connect_async(target.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                let delay = backoff.next_delay();
                warn!(url = %target, error = %err, retry_in_ms = delay.as_millis() as u64, "connect failed");
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(_) => {
                let delay = backoff.next_delay();
                warn!(url = %target, retry_in_ms = delay.as_millis() as u64, "connect timed out");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        backoff.reset();
        info!(device_id = %device_id, url = %target, "simulated device connected");
        let (mut write, mut read) = stream.split();
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let frame = plant.sample().to_string();
                    if let Err(err) = write.send(Message::Text(frame.into())).await {
                        warn!(error = %err, "telemetry send failed");
                        break;
                    }
                    sent += 1;
                    if count.is_some_and(|limit| sent >= limit) {
                        let _ = write.close().await;
                        return Ok(());
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DeviceMessage>(text.as_str()) {
                            Ok(DeviceMessage::Command { command, value, .. }) => {
                                info!(command = %command, value = %value, "command received");
                                plant.apply(&command, &value);
                            }
                            Ok(DeviceMessage::Welcome { server, version, .. }) => {
                                debug!(server = %server, version = %version, "relay welcome");
                            }
                            Err(err) => debug!(error = %err, "ignoring relay frame"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(close = ?frame, "relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "relay connection failed");
                        break;
                    }
                    None => break,
                }
            }
        }

        let delay = backoff.next_delay();
        info!(retry_in_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

pub async fn run_watch(url: String, device: Option<String>) -> Result<()> {
    let target = connect_url(&url, "viewer", device.as_deref())?;
    let mut backoff = Backoff::default();

    loop {
        match timeout(Duration::from_secs(5), connect_async(target.as_str())).await {
            Ok(Ok((stream, _))) => {
                backoff.reset();
                info!(url = %target, "watching relay");
                let (_write, mut read) = stream.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => println!("{}", text.as_str()),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "relay connection failed");
                            break;
                        }
                    }
                }
            }
            Ok(Err(err)) => warn!(url = %target, error = %err, "connect failed"),
            Err(_) => warn!(url = %target, "connect timed out"),
        }

        let delay = backoff.next_delay();
        info!(retry_in_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

pub async fn run_send(url: String, device: String, command: String, value: String) -> Result<()> {
    let device_id = DeviceId::parse(&device).map_err(|err| anyhow!("invalid device id: {err}"))?;
    let target = connect_url(&url, "viewer", None)?;
    let (stream, _) = timeout(Duration::from_secs(5), connect_async(target.as_str()))
        .await
        .map_err(|_| anyhow!("connection timeout - is the relay running?"))?
        .with_context(|| format!("failed to connect to {target}"))?;
    let (mut write, mut read) = stream.split();

    let request = ViewerMessage::Command {
        device: device_id.clone(),
        command: command.clone(),
        value: parse_value(&value),
    };
    write
        .send(Message::Text(serde_json::to_string(&request)?.into()))
        .await?;

    let outcome = timeout(Duration::from_secs(5), async {
        while let Some(message) = read.next().await {
            let Message::Text(text) = message? else {
                continue;
            };
            match serde_json::from_str::<RelayMessage>(text.as_str()) {
                Ok(RelayMessage::Ack { device, command }) if device == device_id => {
                    return Ok::<_, anyhow::Error>(command);
                }
                Ok(RelayMessage::Error { code, message, .. }) => {
                    bail!("relay rejected command ({}): {}", code.as_str(), message);
                }
                _ => {}
            }
        }
        Err::<String, anyhow::Error>(anyhow!("connection closed before acknowledgement"))
    })
    .await
    .map_err(|_| anyhow!("no acknowledgement within 5 seconds"))??;

    info!(device_id = %device_id, command = %outcome, "command acknowledged");
    let _ = write.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_normalizes_scheme() {
        assert_eq!(
            connect_url("localhost:8080", "device", Some("pump-1"))
                .unwrap()
                .as_str(),
            "ws://localhost:8080/ws?type=device&device=pump-1"
        );
        assert_eq!(
            connect_url("https://relay.example.com/", "viewer", None)
                .unwrap()
                .as_str(),
            "wss://relay.example.com/ws?type=viewer"
        );
    }

    #[test]
    fn bare_words_become_strings() {
        assert_eq!(parse_value("1"), json!(1));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("on"), json!("on"));
    }

    #[test]
    fn simulator_applies_commands() {
        let mut plant = SimulatedPlant::default();
        plant.apply("pump", &json!(1));
        plant.apply("light", &json!("on"));
        let sample = plant.sample();
        assert_eq!(sample["pump"], true);
        assert_eq!(sample["light"], true);
        plant.apply("pump", &json!(false));
        assert!(!plant.pump);
    }

    #[test]
    fn cli_defaults_to_serving() {
        let cli = Cli::try_parse_from(["ecogrow-relay"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["ecogrow-relay", "watch", "--device", "pump-1"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Watch { device: Some(_), .. })));
    }
}
