//! `labbus` — bus utility for poking at GPIB instruments.
//!
//! Reads a TOML file naming a bus adapter and its settings, builds the
//! interface through the factory registry, and runs one of a few simple
//! operations against it:
//!
//! ```text
//! labbus --config bench.toml scan
//! labbus --config bench.toml query 17 "*IDN?"
//! labbus types
//! ```
//!
//! Example configuration:
//!
//! ```toml
//! [bus]
//! type = "prologix"
//!
//! [bus.config]
//! device = "/dev/ttyUSB0"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labbus_core::{BusRegistry, GpibAddress, GpibErrorKind, GpibInterface, TransferFlags};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "labbus", about = "GPIB bus utility", version)]
struct Cli {
    /// Path to the bus configuration file.
    #[arg(long, short, default_value = "labbus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serial-poll every address and report the ones that answer.
    Scan,
    /// Send one line to a device and print its one-line response.
    Query {
        /// GPIB address of the device (0-30).
        address: u8,
        /// Command line to send, e.g. "*IDN?".
        line: String,
    },
    /// Send one line without reading a response.
    Send {
        address: u8,
        line: String,
    },
    /// List the bus adapter types this build knows about.
    Types,
}

#[derive(Deserialize)]
struct ConfigFile {
    bus: BusSection,
}

#[derive(Deserialize)]
struct BusSection {
    #[serde(rename = "type")]
    bus_type: String,
    config: Option<toml::Value>,
}

fn registry() -> BusRegistry {
    let mut registry = BusRegistry::new();
    registry.register(Box::new(labbus_prologix::PrologixFactory));
    registry.register(Box::new(labbus_k500serial::K500SerialFactory));
    registry.register(Box::new(labbus_micro488ex::Micro488ExFactory));
    registry.register(Box::new(labbus_usbtmc::UsbtmcFactory));
    registry.register(Box::new(labbus_network::NetworkGpibFactory));
    #[cfg(feature = "linux-gpib")]
    registry.register(Box::new(labbus_ni488::Ni488Factory));
    registry
}

async fn open_interface(config_path: &PathBuf) -> Result<Arc<GpibInterface>> {
    let raw = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("cannot read {}", config_path.display()))?;
    let parsed: ConfigFile =
        toml::from_str(&raw).with_context(|| format!("invalid {}", config_path.display()))?;

    let config = parsed
        .bus
        .config
        .unwrap_or(toml::Value::Table(toml::map::Map::new()));

    debug!(bus_type = %parsed.bus.bus_type, "building interface");
    registry().build(&parsed.bus.bus_type, config).await
}

async fn scan(interface: &GpibInterface) -> Result<()> {
    let mut responders = 0usize;
    for address in GpibAddress::all() {
        match interface.serial_poll(address).await {
            Ok(status_byte) => {
                println!("address {address:2}: status byte {status_byte:#04x}");
                responders += 1;
            }
            Err(e) if e.kind() == GpibErrorKind::Unsupported => {
                anyhow::bail!("this adapter does not support serial polls; cannot scan");
            }
            Err(e) => {
                debug!(%address, error = %e, "no response");
            }
        }
    }
    println!("{responders} device(s) responded");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Types => {
            for bus_type in registry().bus_types() {
                println!("{bus_type}");
            }
        }
        Command::Scan => {
            let interface = open_interface(&cli.config).await?;
            scan(&interface).await?;
        }
        Command::Query { address, line } => {
            let interface = open_interface(&cli.config).await?;
            let address = GpibAddress::try_from(address)?;
            interface.open_device(address).await?;
            interface
                .put_line(address, &line, TransferFlags::NONE)
                .await?;
            let response = interface.get_line(address, TransferFlags::NONE).await?;
            println!("{response}");
            interface.close_device(address).await?;
        }
        Command::Send { address, line } => {
            let interface = open_interface(&cli.config).await?;
            let address = GpibAddress::try_from(address)?;
            interface.open_device(address).await?;
            interface
                .put_line(address, &line, TransferFlags::NONE)
                .await?;
            interface.close_device(address).await?;
        }
    }

    Ok(())
}
