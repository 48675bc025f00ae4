//! Veil Network Layer
//!
//! Tracks the underlay network a VPN tunnel rides on.
//!
//! Architecture:
//! 1. The OS (or a platform shim) pushes raw callbacks into a [`NetworkSource`]
//! 2. The [`NetworkTracker`] callback thread folds them into an [`UnderlayState`]
//! 3. Only value changes are published, over a `tokio::sync::watch` channel
//!
//! A network that is itself a VPN is never published as eligible.

mod source;
mod tracker;
mod underlay;

pub use source::{
    ChannelSource, EventSink, NetworkRequest, NetworkSource, RawNetworkEvent, SourceError,
    SubscriptionId,
};
pub use tracker::NetworkTracker;
pub use underlay::{
    link_fingerprint, Capabilities, LinkAddress, LinkProperties, NetworkId, RouteEntry,
    UnderlayState,
};
