//! Error taxonomy for the bridge
//!
//! Every failure the bridge can observe is folded into [`BridgeError`] so the
//! supervisor can decide between retrying and giving up, and so the last error
//! can be stored and reported without holding on to driver-specific types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::transport::Side;

/// Errors produced by discovery, the transports and the bridge engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// No advertised name matched the filter before the scan timeout elapsed
    #[error("no device matching \"{filter}\" found within {timeout:?}")]
    NotFound { filter: String, timeout: Duration },

    /// The BLE stack could not scan or connect (no adapter, permission denied, ...)
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The serial device is missing or already held exclusively
    #[error("serial port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    /// A transport went away while the session was running
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// A destination write did not complete in time
    #[error("{side} write did not complete within {timeout:?}")]
    WriteTimeout { side: Side, timeout: Duration },

    /// The connected peripheral does not expose a configured characteristic
    #[error("characteristic {0} not found on peripheral")]
    CharacteristicNotFound(Uuid),

    /// Explicit stop; terminal but not a fault
    #[error("cancelled")]
    Cancelled,

    /// The bridge configuration was rejected before starting
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeError {
    /// Whether the supervisor may try again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::InvalidConfig(_))
    }

    pub(crate) fn port_unavailable(port: &str, reason: impl ToString) -> Self {
        Self::PortUnavailable {
            port: port.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type used across the bridge library
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let retryable = [
            BridgeError::NotFound {
                filter: "ESP32S3_HELLO".into(),
                timeout: Duration::from_secs(5),
            },
            BridgeError::AdapterUnavailable("no adapter".into()),
            BridgeError::port_unavailable("COM9", "busy"),
            BridgeError::TransportClosed("peer went away".into()),
            BridgeError::WriteTimeout {
                side: Side::Serial,
                timeout: Duration::from_millis(100),
            },
        ];
        for err in retryable {
            assert!(err.is_retryable(), "{err} should be retryable");
        }

        assert!(!BridgeError::Cancelled.is_retryable());
        assert!(!BridgeError::InvalidConfig("empty filter".into()).is_retryable());
    }

    #[test]
    fn test_messages_name_the_resource() {
        let err = BridgeError::port_unavailable("/dev/ttyUSB0", "device busy");
        assert_eq!(
            err.to_string(),
            "serial port /dev/ttyUSB0 unavailable: device busy"
        );

        let err = BridgeError::WriteTimeout {
            side: Side::Ble,
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "ble write did not complete within 250ms");
    }
}
