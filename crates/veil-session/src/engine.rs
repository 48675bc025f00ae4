//! Tunnel Engine adapter contract
//!
//! The tunnel engine itself (protocols, packet processing, outbound
//! selection) is opaque. The session controller only needs the handful of
//! operations below, plus a way to push the current underlay network into
//! the engine for its outbound dialing decisions.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use veil_network::NetworkId;

/// Lock-free handle to the current underlay network.
///
/// Written only by the session controller; the engine reads it whenever it
/// needs to pick the interface for an outbound socket.
#[derive(Debug, Clone, Default)]
pub struct CurrentNetwork(Arc<AtomicU64>);

impl CurrentNetwork {
    /// Create an empty handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Network the tunnel should currently ride on
    pub fn get(&self) -> Option<NetworkId> {
        NetworkId::new(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, network: Option<NetworkId>) {
        self.0.store(network.map_or(0, |n| n.get()), Ordering::Release);
    }
}

/// Tunnel engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Engine init failed: {0}")]
    Init(String),

    #[error("Engine not running")]
    NotRunning,

    #[error("Failed to bind underlying network: {0}")]
    Bind(String),

    #[error("Probe failed: {0}")]
    Probe(String),
}

/// Platform tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Validate `config` and bring the tunnel up.
    ///
    /// `underlying` stays readable for the whole session and always holds
    /// the latest underlay network.
    async fn start(&self, config: &str, underlying: CurrentNetwork) -> Result<(), EngineError>;

    /// Tear the tunnel down. Idempotent.
    async fn stop(&self);

    /// Ask the engine to drop and re-dial its sockets.
    ///
    /// Returns false when unsupported or not running.
    async fn reset_network(&self) -> bool;

    /// Kick off a latency test of every candidate in `group`.
    ///
    /// Fire-and-forget: the engine selects a live candidate on its own.
    fn url_test(&self, group: &str);

    /// Bind the tunnel's own traffic to `network` (`None` clears the binding)
    async fn bind_underlying(&self, network: Option<NetworkId>) -> Result<(), EngineError>;

    /// Lightweight reachability check of the currently selected route
    async fn probe(&self) -> Result<(), EngineError>;
}
