//! Bridge engine
//!
//! Relays bytes between a BLE connection and a serial port:
//!
//! - [`pump`] - one direction, chunk in, chunk out
//! - [`session`] - wiring, lifecycle and teardown of both directions
//! - [`state`] - the session state machine

pub mod pump;
pub mod session;
pub mod state;

pub use pump::Direction;
pub use session::{BridgeSession, SessionMonitor, SessionOutcome};
pub use state::SessionState;
