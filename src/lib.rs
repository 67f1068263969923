//! BLE to serial bridge
//!
//! Finds a BLE peripheral by name, subscribes to its notify characteristic
//! (Nordic UART Service by default) and relays every notification, byte for
//! byte, to a serial port. In bidirectional mode serial input is written back
//! to the peripheral. A supervisor keeps the bridge alive across disconnects.

pub mod ble;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod serial;
pub mod supervisor;
pub mod transport;

pub use config::{AttemptLimit, BridgeConfig, DirectionMode, GattProfile, RetryPolicy};
pub use discovery::DiscoveryResolver;
pub use error::{BridgeError, Result};
pub use supervisor::{BridgeEvent, BridgeStatus, Supervisor, SupervisorExit, SupervisorHandle};
