//! Structured bridge events
//!
//! Everything the bridge has to say about its progress is published as a
//! [`BridgeEvent`] on a broadcast channel. Front ends decide how to render
//! them; the CLI logs each one at [`BridgeEvent::level`].

use core::fmt;
use std::time::Duration;

use log::Level;

use crate::ble::DeviceDescriptor;
use crate::bridge::SessionState;
use crate::error::BridgeError;
use crate::supervisor::SupervisorExit;

/// Progress report from the supervisor or a session
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Discovery for a new attempt began
    AttemptStarted { attempt: u32 },
    /// Discovery resolved the name filter
    DeviceFound { attempt: u32, device: DeviceDescriptor },
    /// A session changed state
    SessionState { session: u32, state: SessionState },
    /// An attempt ended in an error
    AttemptFailed { attempt: u32, error: BridgeError },
    /// The supervisor is waiting before the next attempt
    RetryScheduled { failures: u32, delay: Duration },
    /// The supervisor loop exited
    Finished(SupervisorExit),
}

impl BridgeEvent {
    /// Log level the event deserves
    pub fn level(&self) -> Level {
        match self {
            Self::AttemptStarted { .. } | Self::RetryScheduled { .. } => Level::Debug,
            Self::SessionState { state, .. } => match state {
                SessionState::Created | SessionState::Connecting | SessionState::Stopping => {
                    Level::Debug
                }
                SessionState::Active | SessionState::Stopped => Level::Info,
                SessionState::Failed => Level::Warn,
            },
            Self::DeviceFound { .. } => Level::Info,
            Self::AttemptFailed { .. } => Level::Warn,
            Self::Finished(SupervisorExit::Stopped) => Level::Info,
            Self::Finished(_) => Level::Error,
        }
    }
}

impl fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptStarted { attempt } => write!(f, "attempt {}: scanning", attempt),
            Self::DeviceFound { attempt, device } => write!(
                f,
                "attempt {}: found {} [{}]",
                attempt, device.name, device.address
            ),
            Self::SessionState { session, state } => write!(f, "session {}: {}", session, state),
            Self::AttemptFailed { attempt, error } => {
                write!(f, "attempt {} failed: {}", attempt, error)
            }
            Self::RetryScheduled { failures, delay } => write!(
                f,
                "retrying in {:?} ({} consecutive failures)",
                delay, failures
            ),
            Self::Finished(exit) => write!(f, "supervisor finished: {}", exit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        let failed = BridgeEvent::SessionState {
            session: 1,
            state: SessionState::Failed,
        };
        assert_eq!(failed.level(), Level::Warn);
        assert_eq!(
            BridgeEvent::Finished(SupervisorExit::Stopped).level(),
            Level::Info
        );
        assert_eq!(
            BridgeEvent::Finished(SupervisorExit::Fatal(BridgeError::Cancelled)).level(),
            Level::Error
        );
    }

    #[test]
    fn test_display() {
        let event = BridgeEvent::DeviceFound {
            attempt: 2,
            device: DeviceDescriptor {
                name: "ESP32S3_HELLO".into(),
                address: "C0:FF:EE:00:00:00".into(),
            },
        };
        assert_eq!(
            event.to_string(),
            "attempt 2: found ESP32S3_HELLO [C0:FF:EE:00:00:00]"
        );

        let retry = BridgeEvent::RetryScheduled {
            failures: 3,
            delay: Duration::from_secs(2),
        };
        assert_eq!(retry.to_string(), "retrying in 2s (3 consecutive failures)");
    }
}
