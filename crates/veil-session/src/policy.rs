//! Recovery policy decisions
//!
//! Pure functions over two consecutive underlay observations. The controller
//! owns the state and the side effects; everything here only decides.

use crate::settings::SessionSettings;
use crate::state::SessionStatus;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use veil_network::UnderlayState;

/// Why a socket reset is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetTrigger {
    /// Network identity changed (or appeared)
    NetworkChanged,
    /// Same network, link fingerprint changed
    LinkChanged,
}

impl ResetTrigger {
    pub(crate) fn min_interval(&self, settings: &SessionSettings) -> Duration {
        match self {
            ResetTrigger::NetworkChanged => settings.reset_on_network_change(),
            ResetTrigger::LinkChanged => settings.reset_on_link_change(),
        }
    }
}

impl fmt::Display for ResetTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetTrigger::NetworkChanged => write!(f, "network changed"),
            ResetTrigger::LinkChanged => write!(f, "link changed"),
        }
    }
}

/// Decide whether the transition `prev → cur` asks for a socket reset.
///
/// Identity change wins over a link change. A fingerprint of 0 is unknown
/// and never counts as a change.
pub(crate) fn reset_trigger(prev: Option<&UnderlayState>, cur: &UnderlayState) -> Option<ResetTrigger> {
    cur.network?;

    if prev.map(|p| p.network) != Some(cur.network) {
        return Some(ResetTrigger::NetworkChanged);
    }

    let prev = prev?;
    let link_changed = prev.link_fingerprint != 0
        && cur.link_fingerprint != 0
        && prev.link_fingerprint != cur.link_fingerprint;

    link_changed.then_some(ResetTrigger::LinkChanged)
}

/// Why a failover probe was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReason {
    ValidatedRestored,
    EligibleRestored,
    NetworkChanged,
}

impl fmt::Display for ProbeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeReason::ValidatedRestored => write!(f, "validated false->true"),
            ProbeReason::EligibleRestored => write!(f, "eligible false->true"),
            ProbeReason::NetworkChanged => write!(f, "network changed/restored"),
        }
    }
}

/// Decide whether the transition `prev → cur` asks for a failover probe.
///
/// Only a usable network (present, eligible, validated) can be probed.
pub(crate) fn failover_trigger(prev: Option<&UnderlayState>, cur: &UnderlayState) -> Option<ProbeReason> {
    if !cur.is_usable() {
        return None;
    }

    let validated_restored = prev.is_some_and(|p| !p.validated);
    let eligible_restored = prev.is_some_and(|p| !p.eligible);
    let network_changed = prev.map(|p| p.network) != Some(cur.network);

    if validated_restored {
        Some(ProbeReason::ValidatedRestored)
    } else if eligible_restored {
        Some(ProbeReason::EligibleRestored)
    } else if network_changed {
        Some(ProbeReason::NetworkChanged)
    } else {
        None
    }
}

/// Status category for an eligibility/validation edge, if there is one
pub(crate) fn underlay_status(prev: Option<&UnderlayState>, cur: &UnderlayState) -> Option<SessionStatus> {
    let edge = prev.is_none_or(|p| p.eligible != cur.eligible || p.validated != cur.validated);
    if !edge {
        return None;
    }

    Some(if !cur.eligible {
        SessionStatus::NoNetwork
    } else if !cur.validated {
        SessionStatus::NetworkUnvalidated
    } else {
        SessionStatus::CheckingServer
    })
}

/// Last-run timestamps of the throttled recovery actions
#[derive(Debug, Default)]
pub(crate) struct ThrottleClock {
    last_reset_at: Option<Instant>,
    last_probe_at: Option<Instant>,
}

impl ThrottleClock {
    /// Claim a reset slot. Both triggers share one timestamp.
    pub(crate) fn try_reset(&mut self, min_interval: Duration) -> bool {
        Self::try_claim(&mut self.last_reset_at, min_interval)
    }

    /// Claim a probe slot
    pub(crate) fn try_probe(&mut self, min_interval: Duration) -> bool {
        Self::try_claim(&mut self.last_probe_at, min_interval)
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    fn try_claim(last: &mut Option<Instant>, min_interval: Duration) -> bool {
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < min_interval) {
            return false;
        }
        *last = Some(now);
        true
    }
}
