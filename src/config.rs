//! Bridge configuration and defaults
//!
//! Default constants are grouped by concern; [`BridgeConfig`] is the flat
//! configuration surface consumed by the supervisor.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Nordic UART Service UUIDs
pub mod nus {
    use uuid::Uuid;

    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    /// RX characteristic: the central writes here
    pub const RX_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
    /// TX characteristic: the peripheral notifies here
    pub const TX_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
}

/// Discovery defaults
pub mod scan {
    pub const TIMEOUT_SECS: u64 = 10;
}

/// Serial defaults
pub mod serial {
    pub const BAUD_RATE: u32 = 115200;
    pub const READ_BUFFER_SIZE: usize = 512;
    /// Driver poll timeout; bounds how long the reader thread or a stalled write takes to notice a close
    pub const READ_POLL_MS: u64 = 50;
    /// Chunks buffered between the reader thread and the pump
    pub const CHANNEL_DEPTH: usize = 16;
}

/// BLE defaults
pub mod ble {
    /// Default ATT MTU (23) minus the 3 byte write header
    pub const MAX_WRITE_LEN: usize = 20;
}

/// Bridge engine defaults
pub mod bridge {
    pub const WRITE_TIMEOUT_MS: u64 = 2000;
    pub const CLOSE_TIMEOUT_MS: u64 = 2000;
}

/// Retry defaults
pub mod retry {
    pub const INITIAL_BACKOFF_MS: u64 = 500;
    pub const MAX_BACKOFF_MS: u64 = 30_000;
    pub const MULTIPLIER: u32 = 2;
}

/// Which directions the bridge relays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionMode {
    /// BLE notifications are written to the serial port only
    #[default]
    BleToSerial,
    /// Additionally, serial input is written to the BLE write characteristic
    Bidirectional,
}

impl DirectionMode {
    pub fn is_bidirectional(self) -> bool {
        self == Self::Bidirectional
    }
}

/// How many consecutive failed attempts the supervisor tolerates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptLimit {
    /// Keep retrying until stopped (long running bridge)
    Unlimited,
    /// Give up after this many consecutive failures (diagnostic run)
    Max(u32),
}

impl AttemptLimit {
    /// Build from a CLI style count where zero means unlimited.
    pub fn from_count(count: u32) -> Self {
        match count {
            0 => Self::Unlimited,
            n => Self::Max(n),
        }
    }

    /// Whether `failures` consecutive failures still allow another attempt.
    pub fn allows_retry(self, failures: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Max(max) => failures < max,
        }
    }
}

/// Retry and backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: AttemptLimit,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: AttemptLimit::Unlimited,
            initial_backoff: Duration::from_millis(retry::INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(retry::MAX_BACKOFF_MS),
            multiplier: retry::MULTIPLIER,
        }
    }
}

/// GATT characteristics the bridge binds to
///
/// Defaults to the Nordic UART Service. Peripherals exposing a single custom
/// characteristic for both directions can use the same UUID for both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    /// Service expected to contain the characteristics, if known
    pub service: Option<Uuid>,
    /// Characteristic the peripheral notifies on
    pub notify: Uuid,
    /// Characteristic serial input is written to
    pub write: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: Some(nus::SERVICE_UUID),
            notify: nus::TX_UUID,
            write: nus::RX_UUID,
        }
    }
}

/// Complete configuration for one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Substring matched against advertised device names
    pub name_filter: String,
    pub scan_timeout: Duration,
    pub port_name: String,
    pub baud_rate: u32,
    pub mode: DirectionMode,
    pub retry: RetryPolicy,
    /// Upper bound for a single write to either side
    pub write_timeout: Duration,
    /// Upper bound for closing a transport during teardown
    pub close_timeout: Duration,
    /// Largest segment written to the BLE characteristic in one operation
    pub max_write_len: usize,
    pub gatt: GattProfile,
}

impl BridgeConfig {
    pub fn new(name_filter: impl Into<String>, port_name: impl Into<String>) -> Self {
        Self {
            name_filter: name_filter.into(),
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Reject configurations the supervisor cannot run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BridgeError::InvalidConfig(msg.to_string()));

        if self.name_filter.trim().is_empty() {
            return invalid("device name filter must not be empty");
        }
        if self.port_name.trim().is_empty() {
            return invalid("serial port name must not be empty");
        }
        if self.baud_rate == 0 {
            return invalid("baud rate must be positive");
        }
        if self.scan_timeout.is_zero() {
            return invalid("scan timeout must be positive");
        }
        if self.write_timeout.is_zero() {
            return invalid("write timeout must be positive");
        }
        if self.close_timeout.is_zero() {
            return invalid("close timeout must be positive");
        }
        if self.max_write_len == 0 {
            return invalid("BLE write length must be positive");
        }
        if self.retry.multiplier == 0 {
            return invalid("backoff multiplier must be at least 1");
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return invalid("initial backoff exceeds maximum backoff");
        }
        if self.retry.max_attempts == AttemptLimit::Max(0) {
            return invalid("attempt limit must allow at least one attempt");
        }

        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name_filter: String::new(),
            scan_timeout: Duration::from_secs(scan::TIMEOUT_SECS),
            port_name: String::new(),
            baud_rate: serial::BAUD_RATE,
            mode: DirectionMode::default(),
            retry: RetryPolicy::default(),
            write_timeout: Duration::from_millis(bridge::WRITE_TIMEOUT_MS),
            close_timeout: Duration::from_millis(bridge::CLOSE_TIMEOUT_MS),
            max_write_len: ble::MAX_WRITE_LEN,
            gatt: GattProfile::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_nus() {
        let config = BridgeConfig::new("ESP32S3_HELLO", "COM9");

        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.mode, DirectionMode::BleToSerial);
        assert_eq!(config.gatt.notify, nus::TX_UUID);
        assert_eq!(config.gatt.write, nus::RX_UUID);
        assert_eq!(config.retry.max_attempts, AttemptLimit::Unlimited);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        let base = BridgeConfig::new("nimble-s3", "/dev/ttyUSB0");

        let mut config = base.clone();
        config.name_filter = "  ".into();
        assert!(matches!(config.validate(), Err(BridgeError::InvalidConfig(_))));

        let mut config = base.clone();
        config.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.max_write_len = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.retry.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = base;
        config.retry.max_attempts = AttemptLimit::Max(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_attempt_limit() {
        assert_eq!(AttemptLimit::from_count(0), AttemptLimit::Unlimited);
        assert_eq!(AttemptLimit::from_count(3), AttemptLimit::Max(3));

        assert!(AttemptLimit::Unlimited.allows_retry(u32::MAX));
        assert!(AttemptLimit::Max(3).allows_retry(2));
        assert!(!AttemptLimit::Max(3).allows_retry(3));
    }
}
