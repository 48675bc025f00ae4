//! veil: VPN session orchestrator
//!
//! Runs a tunnel engine process and keeps it healthy while the underlay
//! network changes. Network events arrive as JSON lines on stdin.
//!
//! Usage: `veil [settings.toml]`

mod config;
mod events;
mod process;
mod settings;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use veil_network::ChannelSource;
use veil_session::{SessionController, SessionFacade};

use crate::config::FileConfigProvider;
use crate::process::ProcessEngine;
use crate::settings::Settings;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_SETTINGS: &str = "veil.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(
            EnvFilter::try_from_env("VEIL_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| "veil=info,veil_session=info,veil_network=info".into()),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS));
    let settings = Settings::load(&path).await?;
    info!("veil starting (engine: {})", settings.engine.command.join(" "));

    let source = Arc::new(ChannelSource::new());
    let engine = Arc::new(ProcessEngine::new(settings.engine.clone()));
    let controller = SessionController::spawn(engine, source.clone(), settings.session.clone());
    let facade = SessionFacade::new(
        controller,
        Arc::new(FileConfigProvider::new(settings.tunnel.config_path.clone())),
    );

    let events = tokio::spawn(events::pump_events(BufReader::new(tokio::io::stdin()), source));
    let watcher = tokio::spawn(log_transitions(facade.controller().clone()));

    facade.connect().await;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, disconnecting");

    facade.close().await;
    watcher.abort();
    events.abort();

    info!("veil stopped");
    Ok(())
}

/// Log every state and status change until the controller goes away
async fn log_transitions(controller: SessionController) {
    let mut state = controller.state();
    let mut status = controller.status();

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                if current.is_error() {
                    warn!("Session {}", current);
                } else {
                    info!("Session {}", current);
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Status: {}", status.borrow_and_update().label());
            }
        }
    }
}
