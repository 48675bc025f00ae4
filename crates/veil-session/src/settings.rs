//! Session timing settings
//!
//! Every delay, throttle window and deadline the controller uses. Loaded
//! from the `[session]` table of the settings file; all fields optional.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controller timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Delay before the single retry of a failed rebind
    pub rebind_retry_ms: u64,
    /// Minimum gap between socket resets when the network changed
    pub reset_on_network_change_ms: u64,
    /// Minimum gap between socket resets when only the link changed
    pub reset_on_link_change_ms: u64,
    /// Quiet period before a failover probe runs
    pub probe_debounce_ms: u64,
    /// Minimum gap between two failover probes
    pub probe_min_interval_ms: u64,
    /// Timeout of one lightweight probe
    pub probe_timeout_ms: u64,
    /// Wait between the group test and the re-probe
    pub probe_settle_ms: u64,
    /// Candidate group tested when the active route is dead
    pub failover_group: String,
    /// Deadline for the engine's stop call
    pub stop_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            rebind_retry_ms: 1_500,
            reset_on_network_change_ms: 1_000,
            reset_on_link_change_ms: 15_000,
            probe_debounce_ms: 800,
            probe_min_interval_ms: 8_000,
            probe_timeout_ms: 5_000,
            probe_settle_ms: 2_000,
            failover_group: "auto".to_string(),
            stop_timeout_ms: 5_000,
        }
    }
}

impl SessionSettings {
    /// Load from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (name, value) in [
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::ZeroTimeout(name));
            }
        }
        if self.reset_on_link_change_ms < self.reset_on_network_change_ms {
            return Err(SettingsError::ResetIntervals);
        }
        if self.failover_group.trim().is_empty() {
            return Err(SettingsError::EmptyGroup);
        }
        Ok(())
    }

    pub fn rebind_retry(&self) -> Duration {
        Duration::from_millis(self.rebind_retry_ms)
    }

    pub fn reset_on_network_change(&self) -> Duration {
        Duration::from_millis(self.reset_on_network_change_ms)
    }

    pub fn reset_on_link_change(&self) -> Duration {
        Duration::from_millis(self.reset_on_link_change_ms)
    }

    pub fn probe_debounce(&self) -> Duration {
        Duration::from_millis(self.probe_debounce_ms)
    }

    pub fn probe_min_interval(&self) -> Duration {
        Duration::from_millis(self.probe_min_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_settle(&self) -> Duration {
        Duration::from_millis(self.probe_settle_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("Link-change reset interval must not be shorter than the network-change one")]
    ResetIntervals,

    #[error("Failover group must not be empty")]
    EmptyGroup,

    #[error("Parse error: {0}")]
    Parse(String),
}
