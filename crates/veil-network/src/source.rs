//! Network-change source boundary
//!
//! The OS subscription mechanics live behind [`NetworkSource`]. A source
//! pushes [`RawNetworkEvent`]s into the [`EventSink`] it was handed at
//! subscription time and answers point lookups for capability and link data.

use crate::tracker::TrackerInput;
use crate::underlay::{Capabilities, LinkProperties, NetworkId};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Raw network-change notification, as delivered by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RawNetworkEvent {
    /// A matching network became available
    Available { network: NetworkId },
    /// A network went away
    Lost { network: NetworkId },
    /// No matching network could be found
    Unavailable,
    /// Capabilities of a network changed
    CapabilitiesChanged {
        network: NetworkId,
        capabilities: Capabilities,
    },
    /// Link properties (addresses, DNS, routes) of a network changed
    LinkPropertiesChanged {
        network: NetworkId,
        link: LinkProperties,
    },
}

impl RawNetworkEvent {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            RawNetworkEvent::Available { .. } => "available",
            RawNetworkEvent::Lost { .. } => "lost",
            RawNetworkEvent::Unavailable => "unavailable",
            RawNetworkEvent::CapabilitiesChanged { .. } => "capabilities",
            RawNetworkEvent::LinkPropertiesChanged { .. } => "link-properties",
        }
    }
}

/// Capability filter for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkRequest {
    pub require_internet: bool,
    pub require_not_restricted: bool,
}

impl NetworkRequest {
    /// Does a network with these capabilities satisfy the request?
    pub fn matches(&self, caps: &Capabilities) -> bool {
        (!self.require_internet || caps.internet)
            && (!self.require_not_restricted || caps.not_restricted)
    }
}

impl Default for NetworkRequest {
    fn default() -> Self {
        Self {
            require_internet: true,
            require_not_restricted: true,
        }
    }
}

/// Subscription handle returned by [`NetworkSource::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Where a source delivers raw events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<TrackerInput>,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<TrackerInput>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Returns false once the receiving tracker is gone.
    pub fn deliver(&self, event: RawNetworkEvent) -> bool {
        self.tx.send(TrackerInput::Event(event)).is_ok()
    }
}

/// Subscription failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// OS network-change subscription
pub trait NetworkSource: Send + Sync {
    /// Register for changes of the best network matching `request`
    fn subscribe(&self, request: &NetworkRequest, sink: EventSink) -> Result<SubscriptionId, SourceError>;

    /// Drop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Current capabilities of a network, if it is known
    fn capabilities(&self, network: NetworkId) -> Option<Capabilities>;

    /// Current link properties of a network, if it is known
    fn link_properties(&self, network: NetworkId) -> Option<LinkProperties>;

    /// The system's current default network, if any
    fn active_network(&self) -> Option<NetworkId>;
}

#[derive(Debug, Default)]
struct NetworkRecord {
    caps: Capabilities,
    link: Option<LinkProperties>,
}

#[derive(Default)]
struct Registry {
    networks: HashMap<NetworkId, NetworkRecord>,
    active: Option<NetworkId>,
    subscribers: Vec<(SubscriptionId, NetworkRequest, EventSink)>,
    next_id: u64,
}

/// In-process [`NetworkSource`] fed by [`ChannelSource::emit`].
///
/// Keeps a registry of the networks it has heard about so lookups agree
/// with the events already delivered. A capability change that makes a
/// network stop matching a subscriber's request reaches that subscriber
/// as `Lost`.
#[derive(Default)]
pub struct ChannelSource {
    registry: Mutex<Registry>,
    refuse: AtomicBool,
}

impl ChannelSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Make further `subscribe` calls fail (simulates a permission error)
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Record an event and fan it out to subscribers
    pub fn emit(&self, event: RawNetworkEvent) {
        let mut reg = self.lock();

        match &event {
            RawNetworkEvent::Available { network } => {
                reg.networks.entry(*network).or_default();
                reg.active = Some(*network);
            }
            RawNetworkEvent::Lost { network } => {
                reg.networks.remove(network);
                if reg.active == Some(*network) {
                    reg.active = None;
                }
            }
            RawNetworkEvent::Unavailable => {
                reg.active = None;
            }
            RawNetworkEvent::CapabilitiesChanged { network, capabilities } => {
                reg.networks.entry(*network).or_default().caps = *capabilities;
            }
            RawNetworkEvent::LinkPropertiesChanged { network, link } => {
                reg.networks.entry(*network).or_default().link = Some(link.clone());
            }
        }

        reg.subscribers.retain(|(id, request, sink)| {
            let delivered = match &event {
                RawNetworkEvent::CapabilitiesChanged { network, capabilities }
                    if !request.matches(capabilities) =>
                {
                    sink.deliver(RawNetworkEvent::Lost { network: *network })
                }
                other => sink.deliver(other.clone()),
            };
            if !delivered {
                debug!("Dropping closed subscription {:?}", id);
            }
            delivered
        });
    }

    /// Announce a network with its capabilities and link properties
    pub fn emit_network(&self, network: NetworkId, caps: Capabilities, link: LinkProperties) {
        self.emit(RawNetworkEvent::Available { network });
        self.emit(RawNetworkEvent::CapabilitiesChanged { network, capabilities: caps });
        self.emit(RawNetworkEvent::LinkPropertiesChanged { network, link });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NetworkSource for ChannelSource {
    fn subscribe(&self, request: &NetworkRequest, sink: EventSink) -> Result<SubscriptionId, SourceError> {
        if self.refuse.load(Ordering::Relaxed) {
            warn!("Refusing network subscription");
            return Err(SourceError::PermissionDenied("subscriptions refused".into()));
        }

        let mut reg = self.lock();
        reg.next_id += 1;
        let id = SubscriptionId(reg.next_id);
        reg.subscribers.push((id, *request, sink));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.retain(|(sub, _, _)| *sub != id);
    }

    fn capabilities(&self, network: NetworkId) -> Option<Capabilities> {
        self.lock().networks.get(&network).map(|r| r.caps)
    }

    fn link_properties(&self, network: NetworkId) -> Option<LinkProperties> {
        self.lock().networks.get(&network).and_then(|r| r.link.clone())
    }

    fn active_network(&self) -> Option<NetworkId> {
        self.lock().active
    }
}
