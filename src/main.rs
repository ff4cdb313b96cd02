//! `lab_capture`: enumerate SpectroScan spectrometers, inspect and change
//! their properties, and capture spectra from the command line.
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lab_capture::config::{Settings, DEFAULT_CONFIG_PATH};
use lab_capture::hardware::mock::{SimulatedSpectroScan, SimulatedUnit};
use lab_capture::hardware::native::NativeDriver;
use lab_capture::{DeviceError, HardwareTypes, Instrument, SpectroScanHardware};

#[derive(Parser)]
#[command(
    name = "lab_capture",
    about = "Capture spectra from SpectroScan FTIR spectrometers"
)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use a simulated unit instead of the vendor driver
    #[arg(long)]
    simulated: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached devices
    List,
    /// Show a device's properties
    Properties {
        /// Device id or serial number
        device: String,
    },
    /// Change one property
    Set {
        /// Device id or serial number
        device: String,
        /// Property id (scan_average, boxcar, calibrate)
        property: String,
        /// New value
        value: String,
    },
    /// Capture one spectrum
    Capture {
        /// Device id or serial number
        device: String,
        /// Apply these property assignments first, e.g. `scan_average=10`
        #[arg(short = 's', long = "set", value_name = "ID=VALUE")]
        assignments: Vec<String>,
        /// Write the spectrum here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.simulated {
        // nothing to replug
        settings.spectroscan.enumerate_settle_ms = 0;
    }

    let driver = native_driver(cli.simulated)?;
    let mut hardware = HardwareTypes::new();
    hardware.register(Arc::new(SpectroScanHardware::new(
        driver,
        settings.spectroscan.clone(),
    )));

    let devices = hardware.enumerate_all().await;
    info!(count = devices.len(), "Enumeration complete");

    let outcome = run(cli.command, &devices).await;
    if !hardware.close_all().await {
        tracing::warn!("Some devices failed to close");
    }
    outcome
}

async fn run(command: Command, devices: &[Arc<dyn Instrument>]) -> Result<()> {
    match command {
        Command::List => {
            let infos: Vec<_> = devices.iter().map(|device| device.info()).collect();
            print_json(&infos)
        }
        Command::Properties { device } => {
            let device = select(devices, &device)?;
            print_json(&device.get_properties().await?)
        }
        Command::Set {
            device,
            property,
            value,
        } => {
            let device = select(devices, &device)?;
            print_json(&device.set_property(&property, &value).await?)
        }
        Command::Capture {
            device,
            assignments,
            output,
        } => {
            let device = select(devices, &device)?;
            for assignment in &assignments {
                let (id, value) = assignment
                    .split_once('=')
                    .with_context(|| format!("Expected ID=VALUE, got '{}'", assignment))?;
                device.set_property(id.trim(), value.trim()).await?;
            }

            let spectrum = device.capture().await?;
            match output {
                Some(path) => {
                    let json = serde_json::to_string_pretty(&spectrum)?;
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(path = %path.display(), points = spectrum.len(), "Spectrum written");
                    Ok(())
                }
                None => print_json(&spectrum),
            }
        }
    }
}

/// Find a device by id, falling back to serial number.
fn select<'a>(devices: &'a [Arc<dyn Instrument>], key: &str) -> Result<&'a Arc<dyn Instrument>> {
    devices
        .iter()
        .find(|device| device.id().to_string() == key)
        .or_else(|| devices.iter().find(|device| device.serial() == key))
        .ok_or_else(|| DeviceError::DeviceNotFound(key.to_string()).into())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn native_driver(simulated: bool) -> Result<NativeDriver> {
    if simulated {
        let sim = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v3("SIM-0001", "NIRONE 2.5"));
        return Ok(NativeDriver::from_shared(Arc::new(sim)));
    }
    vendor_driver()
}

#[cfg(feature = "spectroscan_hardware")]
fn vendor_driver() -> Result<NativeDriver> {
    use lab_capture::hardware::ftdi::VendorSpectroScan;
    Ok(NativeDriver::from_shared(Arc::new(VendorSpectroScan::new())))
}

#[cfg(not(feature = "spectroscan_hardware"))]
fn vendor_driver() -> Result<NativeDriver> {
    Err(DeviceError::FeatureNotEnabled("spectroscan_hardware".to_string()).into())
}
