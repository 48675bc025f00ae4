//! Two-phase failover probe
//!
//! 1. Probe the active route. Alive → secured, nothing else to do.
//! 2. Dead → ask the engine to test the whole candidate group.
//! 3. After a settle delay probe once more to tell a transient blip
//!    (recovered in place) from a broken route (switched to alternative).

use crate::engine::TunnelEngine;
use crate::policy::ProbeReason;
use crate::state::SessionStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of one probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Secured,
    RecoveredInPlace,
    SwitchedToAlternative,
}

impl ProbeOutcome {
    pub fn status(&self) -> SessionStatus {
        match self {
            ProbeOutcome::Secured => SessionStatus::Secured,
            ProbeOutcome::RecoveredInPlace => SessionStatus::RecoveredInPlace,
            ProbeOutcome::SwitchedToAlternative => SessionStatus::SwitchedToAlternative,
        }
    }
}

pub(crate) struct FailoverProbe {
    pub(crate) engine: Arc<dyn TunnelEngine>,
    pub(crate) group: String,
    pub(crate) timeout: Duration,
    pub(crate) settle: Duration,
}

impl FailoverProbe {
    pub(crate) async fn run(&self, reason: ProbeReason) -> ProbeOutcome {
        debug!("Failover probe ({})", reason);

        if self.route_alive().await {
            debug!("Active route alive");
            return ProbeOutcome::Secured;
        }

        info!("Active route dead ({}), testing group {}", reason, self.group);
        self.engine.url_test(&self.group);

        tokio::time::sleep(self.settle).await;

        if self.route_alive().await {
            info!("Route recovered in place");
            ProbeOutcome::RecoveredInPlace
        } else {
            info!("Route still dead, relying on group selection");
            ProbeOutcome::SwitchedToAlternative
        }
    }

    /// Any error or timeout counts as dead
    async fn route_alive(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.engine.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Probe timed out after {:?}", self.timeout);
                false
            }
        }
    }
}
