//! rtnetlink neighbor subscription.
//!
//! Opens a `NETLINK_ROUTE` socket joined to the neighbor multicast group and
//! decodes `RTM_*NEIGH` messages into [`NeighborMessage`]s. The socket sees
//! the namespace of the thread that opened it, so sandbox implementations
//! open it from inside their namespace.

use std::net::IpAddr;

use netlink_packet_core::{NetlinkBuffer, NetlinkMessage, NetlinkPayload, NETLINK_HEADER_LEN};
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket};
use tracing::debug;

use crate::error::{OverlayError, Result};
use crate::neighbor::{
    NeighborEntry, NeighborMessage, NeighborMessageKind, NeighborState, NeighborSubscription,
};
use crate::peer::MacAddress;
use crate::BoxFuture;

/// rtnetlink multicast group for neighbor-table changes.
pub const RTNLGRP_NEIGH: u32 = 3;

const NLMSG_ALIGNTO: usize = 4;

/// Splits a datagram into netlink frames and decodes each one.
///
/// Frames that are not neighbor messages are reported with their kind and no
/// entry. A truncated trailer ends the batch.
#[must_use]
pub fn decode_neighbor_batch(datagram: &[u8]) -> Vec<NeighborMessage> {
    let mut out = Vec::new();
    let mut rest = datagram;

    while rest.len() >= NETLINK_HEADER_LEN {
        let buf = match NetlinkBuffer::new_checked(rest) {
            Ok(buf) => buf,
            Err(e) => {
                let kind =
                    NeighborMessageKind::from_message_type(NetlinkBuffer::new(rest).message_type());
                out.push(NeighborMessage::undecodable(kind, format!("truncated netlink frame: {e}")));
                break;
            }
        };
        let kind = NeighborMessageKind::from_message_type(buf.message_type());
        let len = usize::try_from(buf.length()).unwrap_or(rest.len());
        let frame = rest.get(..len).unwrap_or(rest);

        out.push(match kind {
            NeighborMessageKind::Other(ty) => {
                NeighborMessage::undecodable(kind, format!("message type {ty} is not a neighbor message"))
            }
            _ => match decode_frame(frame) {
                Ok(entry) => NeighborMessage::new(kind, entry),
                Err(reason) => NeighborMessage::undecodable(kind, reason),
            },
        });

        let aligned = len.div_ceil(NLMSG_ALIGNTO) * NLMSG_ALIGNTO;
        rest = rest.get(aligned..).unwrap_or_default();
    }

    out
}

fn decode_frame(frame: &[u8]) -> std::result::Result<NeighborEntry, String> {
    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(frame).map_err(|e| e.to_string())?;
    let neigh = match msg.payload {
        NetlinkPayload::InnerMessage(
            RouteNetlinkMessage::NewNeighbour(m)
            | RouteNetlinkMessage::DelNeighbour(m)
            | RouteNetlinkMessage::GetNeighbour(m),
        ) => m,
        _ => return Err("payload is not a neighbor message".to_string()),
    };
    entry_from(&neigh)
}

fn entry_from(neigh: &NeighbourMessage) -> std::result::Result<NeighborEntry, String> {
    let ip = neigh
        .attributes
        .iter()
        .find_map(|attr| match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            NeighbourAttribute::Destination(NeighbourAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
        .ok_or_else(|| "neighbor message without destination".to_string())?;

    let mac = neigh.attributes.iter().find_map(|attr| match attr {
        NeighbourAttribute::LinkLocalAddress(bytes) => {
            <[u8; 6]>::try_from(bytes.as_slice()).ok().map(MacAddress::new)
        }
        _ => None,
    });

    Ok(NeighborEntry {
        ip,
        state: NeighborState::from_bits(u16::from(neigh.header.state)),
        link_index: neigh.header.ifindex,
        mac,
    })
}

/// Neighbor notifications read from a kernel netlink socket.
pub struct NetlinkNeighborSubscription {
    socket: TokioSocket,
}

impl std::fmt::Debug for NetlinkNeighborSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkNeighborSubscription").finish_non_exhaustive()
    }
}

impl NetlinkNeighborSubscription {
    /// Opens a socket subscribed to neighbor-table changes in the calling
    /// thread's network namespace.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the socket cannot be opened,
    /// bound or joined to the multicast group.
    pub fn open() -> Result<Self> {
        let mut socket = TokioSocket::new(NETLINK_ROUTE).map_err(|e| socket_error("open", &e))?;
        socket
            .socket_mut()
            .bind(&SocketAddr::new(0, 0))
            .map_err(|e| socket_error("bind", &e))?;
        socket
            .socket_mut()
            .add_membership(RTNLGRP_NEIGH)
            .map_err(|e| socket_error("join neighbor group on", &e))?;
        debug!("subscribed to netlink neighbor notifications");
        Ok(Self { socket })
    }
}

fn socket_error(op: &str, e: &std::io::Error) -> OverlayError {
    OverlayError::Sandbox(format!("failed to {op} netlink socket: {e}"))
}

impl NeighborSubscription for NetlinkNeighborSubscription {
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<NeighborMessage>>>> {
        Box::pin(async move {
            let (datagram, _) = self
                .socket
                .recv_from_full()
                .await
                .map_err(|e| socket_error("receive from", &e))?;
            Ok(Some(decode_neighbor_batch(&datagram)))
        })
    }
}
