//! parley-relay binary: load config, bind, and serve signaling.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use parley_config::{config_to_json, load_config, validation, ParleyConfig};
use parley_relay::{serve, ConnectionSettings, Relay};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "parley-relay", about = "Signaling relay for peer-to-peer calls")]
struct Args {
    /// Config file. Defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file).
    #[arg(short, long)]
    port: Option<u16>,
}

fn load(args: &Args) -> Result<ParleyConfig, parley_common::ConfigError> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.relay.port = u32::from(port);
        validation::validate(&config)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> parley_common::Result<()> {
    let args = Args::parse();
    let config = load(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();
    tracing::debug!(config = %config_to_json(&config), "Effective configuration");

    let relay = Relay::default();
    let addr = format!("{}:{}", config.relay.bind_address, config.relay.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("parley-relay listening on {}", addr);

    let stats_relay = relay.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let endpoints = stats_relay.registry().count().await;
            let calls = stats_relay.active_calls().await;
            tracing::debug!(endpoints, calls, "Relay stats");
        }
    });

    serve(listener, relay, ConnectionSettings::from(&config.relay)).await;
    Ok(())
}
