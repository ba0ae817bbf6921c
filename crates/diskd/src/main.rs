//! Binary that runs the disk service against an MQTT broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fleet_bus_mqtt::{MqttBusClient, MqttBusClientOptions};
use fleet_config::FleetConfig;
use fleet_diskd::{DiskManager, Error};
use fleet_service::signal::spawn_signal_listener;
use fleet_service::{ServiceContext, StateManager};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, env = "FLEET_VERBOSE")]
    verbose: bool,

    /// Configuration file, instead of searching the default locations
    #[arg(short, long, env = "FLEET_CONFIG_FILE")]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(if args.verbose {
                Level::DEBUG
            } else {
                Level::INFO
            })
            .finish(),
    )?;

    info!("fleet-diskd {}", env!("CARGO_PKG_VERSION"));

    let config = FleetConfig::load(args.config_file.as_deref())?;
    let service = Arc::new(DiskManager::from_config(&config.diskd));

    let mut options = MqttBusClientOptions::new(
        config.diskd.name.clone(),
        config.bus.host.clone(),
        config.bus.port,
    );
    options.keep_alive = config.bus.keep_alive();
    options.credentials = config.bus.credentials();

    let context = ServiceContext::new(MqttBusClient::new(options), config);
    spawn_signal_listener(context.shutdown_token()).map_err(Error::Signal)?;

    StateManager::new(context, service)?.run().await?;

    info!("fleet-diskd stopped");

    Ok(())
}
