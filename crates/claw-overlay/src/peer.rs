//! Peer resolution and peer table collaborators.
//!
//! The overlay core does not know how peers are discovered across hosts. When
//! the neighbor watcher sees a miss it asks a [`PeerResolver`] who owns the
//! address and pushes the answer into the local neighbor/forwarding tables
//! through a [`PeerTable`].

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use parking_lot::RwLock;

use crate::error::{OverlayError, Result};
use crate::BoxFuture;

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Creates a MAC address from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| OverlayError::InvalidArgument(format!("invalid MAC address: {s}")))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| OverlayError::InvalidArgument(format!("invalid MAC address: {s}")))?;
        }
        if parts.next().is_some() {
            return Err(OverlayError::InvalidArgument(format!("invalid MAC address: {s}")));
        }
        Ok(Self(octets))
    }
}

/// Where an overlay address lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    /// MAC address of the remote endpoint.
    pub mac: MacAddress,
    /// Netmask of the endpoint's overlay address.
    pub mask: Ipv4Addr,
    /// Underlay address of the remote VXLAN tunnel endpoint.
    pub vtep: IpAddr,
}

/// A neighbor entry to program into a network's sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Network the peer belongs to.
    pub network_id: String,
    /// Endpoint identifier (`"dummy"` for entries learned from a miss).
    pub endpoint_id: String,
    /// Overlay address of the peer.
    pub ip: Ipv4Addr,
    /// Resolved location of the peer.
    pub entry: PeerEntry,
    /// Learned reactively rather than announced.
    pub dynamic: bool,
}

/// Looks up the owner of an overlay address.
pub trait PeerResolver: Send + Sync {
    /// Resolves `ip` within `network_id`.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Resolution`] if no peer owns the address.
    fn resolve_peer<'a>(&'a self, network_id: &'a str, ip: Ipv4Addr)
        -> BoxFuture<'a, Result<PeerEntry>>;
}

/// Programs peers into the local forwarding state.
pub trait PeerTable: Send + Sync {
    /// Adds a neighbor entry to the network's sandbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be programmed.
    fn add_peer(&self, record: PeerRecord) -> BoxFuture<'_, Result<()>>;

    /// Replays known peers into a freshly created sandbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay fails.
    fn update_sandbox<'a>(&'a self, network_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// In-process peer database acting as both resolver and table.
#[derive(Debug, Default)]
pub struct MemoryPeerDb {
    known: RwLock<HashMap<(String, Ipv4Addr), PeerEntry>>,
    added: RwLock<Vec<PeerRecord>>,
    sandbox_updates: RwLock<HashMap<String, usize>>,
}

impl MemoryPeerDb {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer that [`PeerResolver::resolve_peer`] will return.
    pub fn insert(&self, network_id: &str, ip: Ipv4Addr, entry: PeerEntry) {
        self.known.write().insert((network_id.to_string(), ip), entry);
    }

    /// Entries programmed through [`PeerTable::add_peer`], in order.
    #[must_use]
    pub fn added_peers(&self) -> Vec<PeerRecord> {
        self.added.read().clone()
    }

    /// Number of sandbox replays requested for `network_id`.
    #[must_use]
    pub fn sandbox_updates(&self, network_id: &str) -> usize {
        self.sandbox_updates
            .read()
            .get(network_id)
            .copied()
            .unwrap_or(0)
    }
}

impl PeerResolver for MemoryPeerDb {
    fn resolve_peer<'a>(
        &'a self,
        network_id: &'a str,
        ip: Ipv4Addr,
    ) -> BoxFuture<'a, Result<PeerEntry>> {
        Box::pin(async move {
            self.known
                .read()
                .get(&(network_id.to_string(), ip))
                .copied()
                .ok_or_else(|| {
                    OverlayError::Resolution(format!("no peer owns {ip} in network {network_id}"))
                })
        })
    }
}

impl PeerTable for MemoryPeerDb {
    fn add_peer(&self, record: PeerRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.added.write().push(record);
            Ok(())
        })
    }

    fn update_sandbox<'a>(&'a self, network_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            *self
                .sandbox_updates
                .write()
                .entry(network_id.to_string())
                .or_default() += 1;
            Ok(())
        })
    }
}
