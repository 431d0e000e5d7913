use anyhow::Result;
use clap::Parser;
use tracing::info;

use ecogrow_relay::cli::{self, Cli, Commands};
use ecogrow_relay::config::{RelayConfig, ServeArgs};
use ecogrow_relay::server;
use ecogrow_relay::telemetry::{self, Telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        None => serve(cli.serve).await,
        Some(Commands::Serve(args)) => serve(args).await,
        Some(Commands::SimulateDevice {
            url,
            device,
            interval_secs,
            count,
        }) => {
            telemetry::init_tracing()?;
            cli::run_simulated_device(url, device, interval_secs, count).await
        }
        Some(Commands::Watch { url, device }) => {
            telemetry::init_tracing()?;
            cli::run_watch(url, device).await
        }
        Some(Commands::Send {
            url,
            device,
            command,
            value,
        }) => {
            telemetry::init_tracing()?;
            cli::run_send(url, device, command, value).await
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(args)?;
    info!(
        listen_addr = %config.listen_addr,
        server = %config.server.name,
        version = %config.server.version,
        "starting ecogrow relay"
    );
    server::run(config, Some(telemetry.metrics_handle())).await
}
