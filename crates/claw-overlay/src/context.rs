//! Shared handles to the overlay's external collaborators.

use std::sync::Arc;

use crate::config::OverlayConfig;
use crate::idm::IdAllocator;
use crate::peer::{PeerResolver, PeerTable};
use crate::sandbox::{SandboxProvider, VxlanLinks};
use crate::store::KvStore;

/// Everything a network needs to reach outside itself.
///
/// One context is shared by the driver and every network it owns.
pub struct OverlayContext {
    /// Driver configuration.
    pub config: OverlayConfig,
    /// Distributed record store.
    pub store: Arc<dyn KvStore>,
    /// Cluster-wide VNI allocator.
    pub vxlan_idm: Arc<dyn IdAllocator>,
    /// Network namespace factory.
    pub sandboxes: Arc<dyn SandboxProvider>,
    /// Host VXLAN device factory.
    pub links: Arc<dyn VxlanLinks>,
    /// Peer lookup for neighbor misses.
    pub resolver: Arc<dyn PeerResolver>,
    /// Peer programming into sandboxes.
    pub peers: Arc<dyn PeerTable>,
}

impl std::fmt::Debug for OverlayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
