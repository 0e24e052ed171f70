//! Command-line driver for the MX5 DAQ pipeline.
//!
//! Connects to the acquisition module, streams readings to stdout as one JSON
//! event per line and logs them to CSV until Ctrl-C or the link is lost.

use anyhow::{Context, Result};
use clap::Parser;
use mx5daq_core::prelude::*;
use mx5daq_core::serial::list_ports;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the link state is checked while streaming
const STATUS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Parser)]
#[command(name = "mx5daq", version, about = "Stream MX5 DAQ sensor readings as JSON and log them to CSV")]
struct Args {
    /// Config file (defaults to the per-user config path)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial port; auto-detected when neither this nor the config sets one
    #[arg(long)]
    port: Option<String>,

    /// Name of the auto-started logging session
    #[arg(long, value_name = "NAME")]
    session: Option<String>,

    /// Do not open a logging session on start
    #[arg(long)]
    no_log: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn load_config(args: &Args) -> Result<DaqConfig> {
    let mut config = match args.config.clone().or_else(DaqConfig::default_path) {
        Some(path) => DaqConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaqConfig::default(),
    };
    config.apply_env();
    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }
    if args.no_log {
        config.logging.auto_log = false;
    }
    if let Some(session) = &args.session {
        config.logging.default_session = session.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.list_ports {
        for port in list_ports() {
            println!(
                "{}\t{}",
                port.name,
                port.product.as_deref().unwrap_or("-")
            );
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    info!(version = mx5daq_core::VERSION, "MX5 DAQ starting");

    let mut controller = Controller::new(config);
    let (_subscription, mut readings) = controller.subscribe_channel();

    let port = tokio::task::block_in_place(|| controller.connect_configured())
        .context("connecting to the acquisition module")?;
    tokio::task::block_in_place(|| controller.start_streaming())
        .context("starting the read loop")?;
    info!(port = %port, "Streaming; press Ctrl-C to stop");

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    let exit = loop {
        tokio::select! {
            Some(reading) = readings.recv() => {
                let event = serde_json::json!({ "event": "sensor_data", "data": reading });
                println!("{}", event);
            }
            _ = status_tick.tick() => {
                let status = controller.status();
                if !status.connected {
                    error!(error = ?status.last_error, "Link to the acquisition module lost");
                    break Err(anyhow::anyhow!("acquisition module disconnected"));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
        }
    };

    if let Err(e) = tokio::task::block_in_place(|| controller.shutdown()) {
        warn!(error = %e, "Shutdown was not clean");
    }
    exit
}
