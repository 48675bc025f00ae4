//! Session state and user-visible status

use std::fmt;

/// Tunnel session state
///
/// `Down → Connecting → Up → Down`, or `Connecting → Error` on a failed
/// start. `Error` holds until the next start or stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Down,
    /// Engine start in progress
    Connecting,
    /// Tunnel is up
    Up,
    /// Start failed
    Error(String),
}

impl SessionState {
    /// Check if the tunnel is usable
    pub fn is_up(&self) -> bool {
        matches!(self, SessionState::Up)
    }

    /// Check if a start is in progress
    pub fn is_connecting(&self) -> bool {
        matches!(self, SessionState::Connecting)
    }

    /// Check if the session is idle
    pub fn is_down(&self) -> bool {
        matches!(self, SessionState::Down)
    }

    /// Check if the last start failed
    pub fn is_error(&self) -> bool {
        matches!(self, SessionState::Error(_))
    }

    /// A new session may only begin from `Down` or `Error`
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Down | SessionState::Error(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Down => write!(f, "down"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Up => write!(f, "up"),
            SessionState::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Externally meaningful status category.
///
/// Published only when the category changes, never per raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    /// Up, but no eligible underlay network
    NoNetwork,
    /// Up, network present but reachability not confirmed by the system
    NetworkUnvalidated,
    /// Up, network validated, failover probe pending
    CheckingServer,
    /// Active route answered the probe
    Secured,
    /// Route was dead, then answered again after the group test
    RecoveredInPlace,
    /// Route stayed dead, the group test's selection is in use
    SwitchedToAlternative,
    /// Start failed
    Failed(String),
}

impl SessionStatus {
    /// Short human-readable label
    pub fn label(&self) -> &str {
        match self {
            SessionStatus::Idle => "Disconnected",
            SessionStatus::Connecting => "Connecting…",
            SessionStatus::Connected => "Connected",
            SessionStatus::NoNetwork => "No network / no internet",
            SessionStatus::NetworkUnvalidated => "Network present, internet not confirmed",
            SessionStatus::CheckingServer => "Internet confirmed, checking server…",
            SessionStatus::Secured => "Connection secured",
            SessionStatus::RecoveredInPlace => "Connection recovered",
            SessionStatus::SwitchedToAlternative => "Switched to alternative server",
            SessionStatus::Failed(msg) => msg.as_str(),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
