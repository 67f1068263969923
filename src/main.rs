//! Command line front end for the BLE to serial bridge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use log::{info, log, warn};
use tokio::sync::broadcast;
use uuid::Uuid;

use ble_serial_bridge::ble::{BleCentral, BtleCentral};
use ble_serial_bridge::config::{self, AttemptLimit, BridgeConfig, DirectionMode, GattProfile};
use ble_serial_bridge::logging::init_logging;
use ble_serial_bridge::serial::{available_ports, SystemSerial};
use ble_serial_bridge::{BridgeEvent, DiscoveryResolver, Supervisor};

#[derive(Parser)]
#[command(name = "ble-serial-bridge")]
#[command(about = "Relay BLE UART notifications to a serial port")]
struct Cli {
    /// More log output (-v debug, -vv trace); BLE_BRIDGE_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bridge a BLE device to a serial port until interrupted
    Run(RunArgs),
    /// List named BLE devices in range
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = config::scan::TIMEOUT_SECS)]
        timeout: u64,
    },
    /// Connect to a device and list its GATT services
    Inspect {
        /// Substring of the advertised device name
        #[arg(short, long)]
        name: String,

        /// Scan timeout in seconds
        #[arg(short, long, default_value_t = config::scan::TIMEOUT_SECS)]
        timeout: u64,
    },
    /// List serial ports
    Ports,
}

#[derive(Args)]
struct RunArgs {
    /// Substring of the advertised device name
    #[arg(short, long, default_value = "ESP32S3_HELLO")]
    name: String,

    /// Serial port to relay to
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = config::serial::BAUD_RATE)]
    baud: u32,

    /// Also relay serial input to the device
    #[arg(long)]
    bidirectional: bool,

    /// Scan timeout in seconds
    #[arg(long, default_value_t = config::scan::TIMEOUT_SECS)]
    scan_timeout: u64,

    /// Consecutive failed attempts before giving up (0 = retry forever)
    #[arg(long, default_value_t = 0)]
    max_attempts: u32,

    /// First retry delay in milliseconds
    #[arg(long, default_value_t = config::retry::INITIAL_BACKOFF_MS)]
    initial_backoff_ms: u64,

    /// Longest retry delay in milliseconds
    #[arg(long, default_value_t = config::retry::MAX_BACKOFF_MS)]
    max_backoff_ms: u64,

    /// Per-write timeout in milliseconds
    #[arg(long, default_value_t = config::bridge::WRITE_TIMEOUT_MS)]
    write_timeout_ms: u64,

    /// Largest BLE write segment in bytes
    #[arg(long, default_value_t = config::ble::MAX_WRITE_LEN)]
    max_write_len: usize,

    /// Notify characteristic UUID (default: NUS TX)
    #[arg(long)]
    notify_uuid: Option<Uuid>,

    /// Write characteristic UUID (default: NUS RX)
    #[arg(long)]
    write_uuid: Option<Uuid>,
}

impl RunArgs {
    fn into_config(self) -> BridgeConfig {
        let mut gatt = GattProfile::default();
        if self.notify_uuid.is_some() || self.write_uuid.is_some() {
            gatt.service = None;
        }
        if let Some(uuid) = self.notify_uuid {
            gatt.notify = uuid;
        }
        if let Some(uuid) = self.write_uuid {
            gatt.write = uuid;
        }

        let mut config = BridgeConfig::new(self.name, self.port);
        config.baud_rate = self.baud;
        config.mode = if self.bidirectional {
            DirectionMode::Bidirectional
        } else {
            DirectionMode::BleToSerial
        };
        config.scan_timeout = Duration::from_secs(self.scan_timeout);
        config.retry.max_attempts = AttemptLimit::from_count(self.max_attempts);
        config.retry.initial_backoff = Duration::from_millis(self.initial_backoff_ms);
        config.retry.max_backoff = Duration::from_millis(self.max_backoff_ms);
        config.write_timeout = Duration::from_millis(self.write_timeout_ms);
        config.max_write_len = self.max_write_len;
        config.gatt = gatt;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Scan { timeout } => scan(Duration::from_secs(timeout)).await,
        Command::Inspect { name, timeout } => inspect(&name, Duration::from_secs(timeout)).await,
        Command::Ports => ports(),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.into_config();
    let central = Arc::new(BtleCentral::first_adapter().await?);
    let supervisor = Supervisor::new(central, Arc::new(SystemSerial));

    info!(
        "Bridging \"{}\" to {} at {} baud ({:?})",
        config.name_filter, config.port_name, config.baud_rate, config.mode
    );
    let events = supervisor.subscribe();
    let logger = tokio::spawn(log_events(events));
    let handle = supervisor.start(config)?;

    let finished = tokio::select! {
        exit = handle.wait() => Some(exit),
        _ = tokio::signal::ctrl_c() => None,
    };
    if finished.is_none() {
        info!("Interrupted, shutting down");
    }
    let exit = handle.stop().await;
    let _ = logger.await;

    if !exit.is_success() {
        anyhow::bail!("bridge {}", exit);
    }
    Ok(())
}

/// Log every event until the supervisor finishes.
async fn log_events(mut events: broadcast::Receiver<BridgeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                log!(event.level(), "{}", event);
                if let BridgeEvent::Finished(_) = event {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Dropped {} bridge events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn scan(timeout: Duration) -> anyhow::Result<()> {
    let central = Arc::new(BtleCentral::first_adapter().await?);
    let resolver = DiscoveryResolver::new(central);

    println!("Scanning for {:?}...", timeout);
    let devices = resolver.discover_all(timeout).await?;

    if devices.is_empty() {
        println!("{}", "No named devices found".yellow());
        return Ok(());
    }
    for device in devices {
        println!("  {} {}", device.address.dimmed(), device.name.bold());
    }
    Ok(())
}

async fn inspect(name: &str, timeout: Duration) -> anyhow::Result<()> {
    let central = Arc::new(BtleCentral::first_adapter().await?);
    let resolver = DiscoveryResolver::new(central.clone());

    println!("Scanning for \"{}\"...", name);
    let device = resolver.find(name, timeout).await?;
    println!("Found {} [{}]", device.name.bold(), device.address);

    let services = central
        .services(&device)
        .await
        .with_context(|| format!("listing services of {}", device.name))?;

    let nus = [config::nus::SERVICE_UUID, config::nus::TX_UUID, config::nus::RX_UUID];
    for service in services {
        let label = service.uuid.to_string();
        if nus.contains(&service.uuid) {
            println!("Service {} {}", label.green().bold(), "(Nordic UART)".green());
        } else {
            println!("Service {}", label.bold());
        }
        for characteristic in service.characteristics {
            println!(
                "  Characteristic {} [{}]",
                characteristic.uuid, characteristic.properties
            );
        }
    }
    Ok(())
}

fn ports() -> anyhow::Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("{}", "No serial ports found".yellow());
    }
    for port in ports {
        println!("  {}", port);
    }
    Ok(())
}
