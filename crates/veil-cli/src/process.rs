//! Tunnel engine running as a child process
//!
//! The engine binary is launched with the config written to disk and killed
//! on stop. Reset, group test and underlay binding are delegated to optional
//! hook commands; the probe is a bounded TCP connect through the tunnel.

use crate::settings::EngineSettings;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use veil_network::NetworkId;
use veil_session::{CurrentNetwork, EngineError, TunnelEngine};

pub struct ProcessEngine {
    settings: EngineSettings,
    child: tokio::sync::Mutex<Option<Child>>,
    underlying: Mutex<Option<CurrentNetwork>>,
    started: AtomicBool,
}

impl ProcessEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            child: tokio::sync::Mutex::new(None),
            underlying: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Network the engine was told to ride on, for logging
    fn underlying(&self) -> Option<NetworkId> {
        self.underlying
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(CurrentNetwork::get)
    }
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    async fn start(&self, config: &str, underlying: CurrentNetwork) -> Result<(), EngineError> {
        let mut child = self.child.lock().await;
        if child.is_some() {
            debug!("Engine already running, ignoring new config ({} bytes)", config.len());
            return Ok(());
        }

        serde_json::from_str::<serde_json::Value>(config)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| EngineError::Init(format!("work dir: {}", e)))?;
        let config_path = self.settings.work_dir.join("tunnel.json");
        tokio::fs::write(&config_path, config)
            .await
            .map_err(|e| EngineError::Init(format!("write config: {}", e)))?;

        let config_arg = config_path.to_string_lossy().into_owned();
        let argv = expand(&self.settings.command, &[("config", config_arg.as_str())]);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::Init("empty engine command".to_string()))?;

        let mut spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Init(format!("spawn {}: {}", program, e)))?;

        tokio::time::sleep(self.settings.startup_grace()).await;
        match spawned.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => return Err(EngineError::Init(format!("engine exited early ({})", status))),
            Err(e) => return Err(EngineError::Init(e.to_string())),
        }

        info!("Engine started (pid {:?})", spawned.id());
        *self.underlying.lock().unwrap_or_else(PoisonError::into_inner) = Some(underlying);
        *child = Some(spawned);
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        *self.underlying.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(e) = child.kill().await {
            warn!("Failed to kill engine: {}", e);
        }
        info!("Engine stopped");
    }

    async fn reset_network(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        let Some(hook) = &self.settings.reset_command else {
            return false;
        };
        match run_hook(hook, &[]).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Reset hook failed: {}", e);
                false
            }
        }
    }

    fn url_test(&self, group: &str) {
        if !self.is_started() {
            return;
        }
        let Some(hook) = &self.settings.url_test_command else {
            return;
        };
        let argv = expand(hook, &[("group", group)]);
        tokio::spawn(async move {
            if let Err(e) = run_hook(&argv, &[]).await {
                warn!("Group test hook failed: {}", e);
            }
        });
    }

    async fn bind_underlying(&self, network: Option<NetworkId>) -> Result<(), EngineError> {
        if !self.is_started() {
            return Err(EngineError::NotRunning);
        }
        let Some(hook) = &self.settings.bind_command else {
            return Ok(());
        };
        let value = network.map_or_else(|| "none".to_string(), |n| n.get().to_string());
        run_hook(hook, &[("network", value.as_str())]).await.map_err(EngineError::Bind)?;
        debug!("Bound to {} (engine sees {:?})", value, self.underlying());
        Ok(())
    }

    async fn probe(&self) -> Result<(), EngineError> {
        if !self.is_started() {
            return Err(EngineError::NotRunning);
        }
        TcpStream::connect(self.settings.probe_address.as_str())
            .await
            .map(drop)
            .map_err(|e| EngineError::Probe(format!("{}: {}", self.settings.probe_address, e)))
    }
}

/// Replace `{name}` placeholders in every argument
fn expand(argv: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (name, value)| acc.replace(&format!("{{{}}}", name), value))
        })
        .collect()
}

/// Run a hook to completion; a non-zero exit is an error
async fn run_hook(argv: &[String], vars: &[(&str, &str)]) -> Result<(), String> {
    let argv = expand(argv, vars);
    let (program, args) = argv.split_first().ok_or("empty hook command")?;

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| format!("{}: {}", program, e))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("{} exited with {}", program, status))
    }
}
