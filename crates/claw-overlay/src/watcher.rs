//! Neighbor-miss watcher.
//!
//! Runs one background task per sandbox generation. The task reads kernel
//! neighbor notifications from inside the sandbox and, for every IPv4 entry
//! the kernel could not resolve, asks the peer resolver who owns the address
//! and programs the answer into the sandbox. Nothing here returns an error to
//! a caller; every failure becomes a log event.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::neighbor::{NeighborMessage, NeighborSubscription};
use crate::peer::{PeerRecord, PeerResolver, PeerTable};

/// Endpoint id recorded for peers learned from a neighbor miss.
pub const MISS_ENDPOINT_ID: &str = "dummy";

/// What the watcher did with one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// Not a new-neighbor or neighbor-query message.
    NotNeighborEvent,
    /// Payload could not be decoded.
    Undecodable,
    /// IPv6 destination; only IPv4 misses are resolved.
    Ipv6,
    /// The entry is neither stale nor incomplete.
    NotAMiss,
    /// Resolved and added to the peer table.
    Healed,
    /// The resolver did not know the address.
    ResolutionFailed,
    /// The peer was resolved but could not be programmed.
    AddFailed,
}

/// Resolves neighbor misses for one network.
#[derive(Clone)]
pub struct NeighborMissWatcher {
    network_id: String,
    resolver: Arc<dyn PeerResolver>,
    peers: Arc<dyn PeerTable>,
    error_backoff: Duration,
}

impl std::fmt::Debug for NeighborMissWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborMissWatcher")
            .field("network_id", &self.network_id)
            .field("error_backoff", &self.error_backoff)
            .finish_non_exhaustive()
    }
}

impl NeighborMissWatcher {
    /// Creates a watcher for `network_id`.
    pub fn new(
        network_id: impl Into<String>,
        resolver: Arc<dyn PeerResolver>,
        peers: Arc<dyn PeerTable>,
        error_backoff: Duration,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            resolver,
            peers,
            error_backoff,
        }
    }

    /// Spawns the watch loop on the current runtime.
    pub fn spawn(
        self,
        subscription: Box<dyn NeighborSubscription>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription, cancel))
    }

    /// Processes notifications until `cancel` fires or the subscription closes.
    pub async fn run(self, mut subscription: Box<dyn NeighborSubscription>, cancel: CancellationToken) {
        debug!(network = %self.network_id, "neighbor watcher started");

        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = subscription.recv() => received,
            };

            match received {
                Ok(Some(batch)) => {
                    for msg in batch {
                        self.handle(msg).await;
                    }
                }
                Ok(None) => {
                    debug!(network = %self.network_id, "neighbor subscription closed");
                    break;
                }
                Err(e) => {
                    error!(network = %self.network_id, error = %e, "failed to receive neighbor notifications");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        debug!(network = %self.network_id, "neighbor watcher stopped");
    }

    /// Handles a single notification.
    pub async fn handle(&self, msg: NeighborMessage) -> MissOutcome {
        if !msg.kind.may_signal_miss() {
            return MissOutcome::NotNeighborEvent;
        }

        let entry = match msg.entry {
            Ok(entry) => entry,
            Err(reason) => {
                error!(network = %self.network_id, %reason, "failed to decode neighbor message");
                return MissOutcome::Undecodable;
            }
        };

        let IpAddr::V4(ip) = entry.ip else {
            return MissOutcome::Ipv6;
        };

        if !entry.state.is_miss() {
            return MissOutcome::NotAMiss;
        }

        debug!(network = %self.network_id, %ip, state = %entry.state, "neighbor miss");

        let peer = match self.resolver.resolve_peer(&self.network_id, ip).await {
            Ok(peer) => peer,
            Err(e) => {
                error!(network = %self.network_id, %ip, error = %e, "could not resolve peer");
                return MissOutcome::ResolutionFailed;
            }
        };

        let record = PeerRecord {
            network_id: self.network_id.clone(),
            endpoint_id: MISS_ENDPOINT_ID.to_string(),
            ip,
            entry: peer,
            dynamic: true,
        };
        match self.peers.add_peer(record).await {
            Ok(()) => {
                info!(network = %self.network_id, %ip, mac = %peer.mac, vtep = %peer.vtep, "resolved neighbor miss");
                MissOutcome::Healed
            }
            Err(e) => {
                error!(network = %self.network_id, %ip, error = %e, "could not add neighbor entry for missed peer");
                MissOutcome::AddFailed
            }
        }
    }
}
