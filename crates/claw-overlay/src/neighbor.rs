//! Kernel neighbor-table notifications.
//!
//! A [`NeighborSubscription`] delivers batches of [`NeighborMessage`]s as the
//! kernel reports neighbor-table changes inside a sandbox. Message kinds and
//! state bits mirror the rtnetlink `RTM_*NEIGH` types and `NUD_*` flags.

use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;

use crate::error::Result;
use crate::peer::MacAddress;
use crate::BoxFuture;

/// rtnetlink message type for a new or updated neighbor.
pub const RTM_NEWNEIGH: u16 = 28;
/// rtnetlink message type for a removed neighbor.
pub const RTM_DELNEIGH: u16 = 29;
/// rtnetlink message type for a neighbor query (address resolution request).
pub const RTM_GETNEIGH: u16 = 30;

/// Kind of a neighbor notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborMessageKind {
    /// `RTM_NEWNEIGH`.
    New,
    /// `RTM_DELNEIGH`.
    Delete,
    /// `RTM_GETNEIGH`.
    Get,
    /// Any other message type on the socket.
    Other(u16),
}

impl NeighborMessageKind {
    /// Maps a netlink message type.
    #[must_use]
    pub const fn from_message_type(ty: u16) -> Self {
        match ty {
            RTM_NEWNEIGH => Self::New,
            RTM_DELNEIGH => Self::Delete,
            RTM_GETNEIGH => Self::Get,
            other => Self::Other(other),
        }
    }

    /// New and query notifications can signal an unresolved address.
    #[must_use]
    pub const fn may_signal_miss(&self) -> bool {
        matches!(self, Self::New | Self::Get)
    }
}

/// `NUD_*` state bits of a neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborState(u16);

impl NeighborState {
    /// `NUD_NONE`.
    pub const NONE: Self = Self(0x00);
    /// `NUD_INCOMPLETE`: resolution in progress.
    pub const INCOMPLETE: Self = Self(0x01);
    /// `NUD_REACHABLE`.
    pub const REACHABLE: Self = Self(0x02);
    /// `NUD_STALE`: entry exists but needs revalidation.
    pub const STALE: Self = Self(0x04);
    /// `NUD_DELAY`.
    pub const DELAY: Self = Self(0x08);
    /// `NUD_PROBE`.
    pub const PROBE: Self = Self(0x10);
    /// `NUD_FAILED`.
    pub const FAILED: Self = Self(0x20);
    /// `NUD_NOARP`.
    pub const NOARP: Self = Self(0x40);
    /// `NUD_PERMANENT`.
    pub const PERMANENT: Self = Self(0x80);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::INCOMPLETE, "incomplete"),
        (Self::REACHABLE, "reachable"),
        (Self::STALE, "stale"),
        (Self::DELAY, "delay"),
        (Self::PROBE, "probe"),
        (Self::FAILED, "failed"),
        (Self::NOARP, "noarp"),
        (Self::PERMANENT, "permanent"),
    ];

    /// Wraps raw state bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw state bits.
    #[must_use]
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Returns true if any bit of `other` is set.
    #[must_use]
    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Stale or incomplete entries are the ones that need resolving.
    #[must_use]
    pub const fn is_miss(&self) -> bool {
        self.intersects(Self(Self::STALE.0 | Self::INCOMPLETE.0))
    }
}

impl BitOr for NeighborState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for NeighborState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(state, _)| self.intersects(*state))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "{:#x}", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// A decoded neighbor-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    /// Destination address being resolved.
    pub ip: IpAddr,
    /// Entry state.
    pub state: NeighborState,
    /// Interface index the entry belongs to.
    pub link_index: u32,
    /// Link-layer address, when known.
    pub mac: Option<MacAddress>,
}

/// One notification from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborMessage {
    /// Message kind.
    pub kind: NeighborMessageKind,
    /// Decoded entry, or the reason decoding failed.
    pub entry: std::result::Result<NeighborEntry, String>,
}

impl NeighborMessage {
    /// A successfully decoded notification.
    #[must_use]
    pub fn new(kind: NeighborMessageKind, entry: NeighborEntry) -> Self {
        Self {
            kind,
            entry: Ok(entry),
        }
    }

    /// A notification whose payload could not be decoded.
    #[must_use]
    pub fn undecodable(kind: NeighborMessageKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            entry: Err(reason.into()),
        }
    }
}

/// Stream of neighbor notifications from inside a sandbox.
pub trait NeighborSubscription: Send {
    /// Waits for the next batch. `Ok(None)` means the subscription closed.
    ///
    /// # Errors
    ///
    /// Returns an error if receiving failed; the subscription may still be usable.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<NeighborMessage>>>>;
}
