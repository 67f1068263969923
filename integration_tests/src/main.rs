//! Hardware-in-the-loop tests for the BLE to serial bridge.
//!
//! Requires a peripheral running a Nordic UART echo firmware (every write to
//! RX is notified back on TX) and a virtual null-modem pair, e.g.
//! `socat -d -d pty,raw,echo=0 pty,raw,echo=0`. The bridge binds one end and
//! the tests drive the other.

mod peer;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use ble_serial_bridge::ble::BtleCentral;
use ble_serial_bridge::logging::init_logging;
use ble_serial_bridge::serial::SystemSerial;
use ble_serial_bridge::{AttemptLimit, BridgeConfig, DirectionMode, Supervisor};

use peer::PeerPort;
use tests::{print_results, report};

#[derive(Parser)]
#[command(name = "bridge-tests")]
#[command(about = "Hardware-in-the-loop tests for ble-serial-bridge")]
struct Args {
    /// BLE device name (substring) of the echo peripheral
    #[arg(long, default_value = "ESP32S3_HELLO")]
    name: String,

    /// Serial port the bridge relays to
    #[arg(long)]
    bridge_port: String,

    /// Other end of the null-modem pair
    #[arg(long)]
    peer_port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,

    /// More log output from the bridge
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    println!("{}", "BLE Serial Bridge Integration Tests".bold());
    println!("Device: \"{}\"", args.name);
    println!("Bridge port: {}", args.bridge_port);
    println!("Peer port: {}", args.peer_port);
    println!("Baud: {}", args.baud);
    println!();

    let mut peer = PeerPort::new(&args.peer_port, args.baud)?;

    let mut config = BridgeConfig::new(&args.name, &args.bridge_port);
    config.baud_rate = args.baud;
    config.mode = DirectionMode::Bidirectional;
    config.scan_timeout = Duration::from_secs(args.scan_timeout);
    config.retry.max_attempts = AttemptLimit::Max(3);

    println!("Starting bridge...");
    let central = Arc::new(BtleCentral::first_adapter().await?);
    let supervisor = Supervisor::new(central, Arc::new(SystemSerial));
    let handle = supervisor.start(config)?;

    println!("\nRunning tests...\n");

    let mut results = Vec::new();
    let active_within = Duration::from_secs(args.scan_timeout + 10);
    results.push(report(
        "Bridge reaches Active",
        tests::test_reaches_active(&handle, active_within).await,
    ));
    results.push(report(
        "AT command echoes back",
        tests::test_echo_round_trip(&mut peer, b"AT\r\n"),
    ));
    let binary: Vec<u8> = (0..=255).collect();
    results.push(report(
        "Binary payload relayed unchanged",
        tests::test_echo_round_trip(&mut peer, &binary),
    ));
    results.push(report(
        "Stop releases the serial port",
        tests::test_stop_releases_port(handle, &args.bridge_port, args.baud).await,
    ));

    print_results(&results);

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
