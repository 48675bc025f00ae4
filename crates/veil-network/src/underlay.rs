//! Underlay network model
//!
//! Snapshot types describing the physical network (Wi-Fi, cellular, ...)
//! that the tunnel rides on, plus the link fingerprint used to notice a
//! silent re-addressing of the same network.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroU64;
use xxhash_rust::xxh3::xxh3_64;

/// Opaque handle identifying a system network.
///
/// Absence ("no usable network") is expressed as `Option<NetworkId>::None`,
/// which lets the handle round-trip through an atomic with 0 as the empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(NonZeroU64);

impl NetworkId {
    /// Create a handle, `None` for the reserved zero value
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw handle value (never zero)
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

/// Capability flags reported by the OS for a network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Network claims internet access
    pub internet: bool,
    /// Network is usable by unprivileged apps
    pub not_restricted: bool,
    /// Network sits behind a captive portal
    pub captive_portal: bool,
    /// Network is not suspended (e.g. cellular in a call)
    pub not_suspended: bool,
    /// System confirmed end-to-end reachability
    pub validated: bool,
    /// Network is itself a VPN
    pub vpn_transport: bool,
}

impl Capabilities {
    /// Usable as a VPN underlay.
    ///
    /// A VPN-transport network is never eligible: binding a tunnel to
    /// another (or its own) VPN network creates a routing loop.
    pub fn is_eligible(&self) -> bool {
        !self.vpn_transport && self.internet && !self.captive_portal && self.not_suspended
    }

    /// Typical capabilities of a healthy, validated network
    pub fn validated_internet() -> Self {
        Self {
            internet: true,
            not_restricted: true,
            captive_portal: false,
            not_suspended: true,
            validated: true,
            vpn_transport: false,
        }
    }
}

/// An address assigned to a link, with its prefix length
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

/// A route installed on a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: IpAddr,
    pub prefix_len: u8,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub interface: Option<String>,
}

/// Link-level properties of a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkProperties {
    pub interface_name: Option<String>,
    pub addresses: Vec<LinkAddress>,
    pub dns_servers: Vec<IpAddr>,
    pub routes: Vec<RouteEntry>,
}

/// Snapshot of the best-matching non-VPN network.
///
/// Value semantics: two snapshots are the same event iff every field matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnderlayState {
    /// Network handle, `None` means no usable network
    pub network: Option<NetworkId>,
    /// Internet-capable, not captive, not suspended, not a VPN
    pub eligible: bool,
    /// System-confirmed reachability
    pub validated: bool,
    /// Interface name, if known
    pub interface_name: Option<String>,
    /// Order-independent hash of addresses, DNS and routes; 0 = unknown
    pub link_fingerprint: u64,
}

impl UnderlayState {
    /// The "no usable network" state
    pub fn absent() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw OS data.
    ///
    /// A network carrying VPN transport collapses to [`UnderlayState::absent`].
    pub fn observe(network: NetworkId, caps: &Capabilities, link: Option<&LinkProperties>) -> Self {
        if caps.vpn_transport {
            return Self::absent();
        }

        Self {
            network: Some(network),
            eligible: caps.is_eligible(),
            validated: caps.validated,
            interface_name: link.and_then(|lp| lp.interface_name.clone()),
            link_fingerprint: link.map(link_fingerprint).unwrap_or(0),
        }
    }

    /// Network present, eligible and validated
    pub fn is_usable(&self) -> bool {
        self.network.is_some() && self.eligible && self.validated
    }
}

impl fmt::Display for UnderlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            None => write!(f, "none"),
            Some(id) => write!(
                f,
                "{} iface={} eligible={} validated={} fp={:#x}",
                id,
                self.interface_name.as_deref().unwrap_or("?"),
                self.eligible,
                self.validated,
                self.link_fingerprint
            ),
        }
    }
}

/// Compute the link fingerprint of a network.
///
/// Each address, DNS server and route is hashed on its own and the
/// per-set hashes are combined with a sum/xor mix, so reordering any set
/// yields the same value. Never returns 0 (reserved for "unknown").
pub fn link_fingerprint(lp: &LinkProperties) -> u64 {
    let addr_h = mix_unordered(lp.addresses.iter().map(|la| {
        let mut buf = ip_bytes(&la.address);
        buf.push(la.prefix_len);
        xxh3_64(&buf)
    }));
    let dns_h = mix_unordered(lp.dns_servers.iter().map(|ip| xxh3_64(&ip_bytes(ip))));
    let route_h = mix_unordered(lp.routes.iter().map(|r| {
        let mut buf = ip_bytes(&r.destination);
        buf.push(r.prefix_len);
        buf.push(0xff);
        if let Some(gw) = r.gateway {
            buf.extend_from_slice(&ip_bytes(&gw));
        }
        buf.push(0xff);
        if let Some(ref iface) = r.interface {
            buf.extend_from_slice(iface.as_bytes());
        }
        xxh3_64(&buf)
    }));
    let iface_h = lp
        .interface_name
        .as_deref()
        .map(|name| xxh3_64(name.as_bytes()))
        .unwrap_or(0);

    let mut h: u64 = 17;
    for part in [iface_h, addr_h, dns_h, route_h] {
        h = h.wrapping_mul(31).wrapping_add(part);
    }

    if h == 0 { 1 } else { h }
}

fn mix_unordered(hashes: impl Iterator<Item = u64>) -> u64 {
    let (sum, xor) = hashes.fold((0u64, 0u64), |(sum, xor), h| (sum.wrapping_add(h), xor ^ h));
    sum.wrapping_mul(31).wrapping_add(xor)
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
