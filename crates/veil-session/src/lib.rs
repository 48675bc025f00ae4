//! Veil Session Layer
//!
//! Keeps a VPN tunnel healthy while the underlay network changes beneath it.
//!
//! - [`SessionController`]: tunnel lifecycle state machine plus recovery
//!   policies (rebinding, socket resets, failover probing)
//! - [`SessionFacade`]: single-flight connect/disconnect for callers
//! - [`TunnelEngine`]: the contract an engine adapter implements

mod controller;
mod engine;
mod facade;
mod failover;
mod policy;
mod settings;
mod state;
mod timer;

#[cfg(test)]
mod testing;

pub use controller::{SessionController, SessionError};
pub use engine::{CurrentNetwork, EngineError, TunnelEngine};
pub use facade::{ConfigProvider, FetchError, SessionFacade};
pub use failover::ProbeOutcome;
pub use policy::ProbeReason;
pub use settings::{SessionSettings, SettingsError};
pub use state::{SessionState, SessionStatus};
