//! Settings file
//!
//! ```toml
//! [session]
//! probe_debounce_ms = 800
//!
//! [engine]
//! command = ["sing-box", "run", "-c", "{config}"]
//! bind_command = ["veil-bind", "{network}"]
//! probe_address = "1.1.1.1:443"
//!
//! [tunnel]
//! config_path = "tunnel.json"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use veil_session::SessionSettings;

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionSettings,
    pub engine: EngineSettings,
    pub tunnel: TunnelSettings,
}

/// How to drive the tunnel engine process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engine command line; `{config}` expands to the written config path
    pub command: Vec<String>,
    /// Socket reset hook
    pub reset_command: Option<Vec<String>>,
    /// Group latency test hook; `{group}` expands to the group tag
    pub url_test_command: Option<Vec<String>>,
    /// Underlay bind hook; `{network}` expands to the network handle or `none`
    pub bind_command: Option<Vec<String>>,
    /// Address dialed by the reachability probe
    pub probe_address: String,
    /// Directory the config is written into
    pub work_dir: PathBuf,
    /// How long the engine must stay alive to count as started
    pub startup_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: vec!["sing-box".into(), "run".into(), "-c".into(), "{config}".into()],
            reset_command: None,
            url_test_command: None,
            bind_command: None,
            probe_address: "1.1.1.1:443".to_string(),
            work_dir: std::env::temp_dir().join("veil"),
            startup_grace_ms: 500,
        }
    }
}

impl EngineSettings {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

/// Where the tunnel config comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub config_path: PathBuf,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("tunnel.json"),
        }
    }
}

impl Settings {
    /// Parse and validate a settings document
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content).context("Invalid settings file")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path`; a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml(&content).with_context(|| format!("Failed to load {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate().context("Invalid [session] settings")?;
        if self.engine.command.is_empty() {
            anyhow::bail!("[engine] command must not be empty");
        }
        for hook in [
            &self.engine.reset_command,
            &self.engine.url_test_command,
            &self.engine.bind_command,
        ]
        .into_iter()
        .flatten()
        {
            if hook.is_empty() {
                anyhow::bail!("[engine] hook commands must not be empty");
            }
        }
        Ok(())
    }
}
