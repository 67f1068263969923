//! Session lifecycle states

use core::fmt;

/// Lifecycle of one bridge session
///
/// ```text
/// Created -> Connecting -> Active -> Stopping -> Stopped
///                 |          |
///                 |          +-----> Failed
///                 +-> Failed
///                 +-> Stopping
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Connecting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Stopped and Failed are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, Active)
                | (Connecting, Failed)
                | (Connecting, Stopping)
                | (Active, Stopping)
                | (Active, Failed)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
