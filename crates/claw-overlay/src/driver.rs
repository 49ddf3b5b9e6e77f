//! Overlay driver: the service object tying networks to their collaborators.
//!
//! # Example
//!
//! ```rust,ignore
//! let db = Arc::new(MemoryPeerDb::new());
//! let driver = OverlayDriver::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .sandboxes(Arc::new(MemorySandboxProvider::new()))
//!     .links(Arc::new(MemoryVxlanLinks::new()))
//!     .peer_db(db)
//!     .build()?;
//!
//! driver
//!     .create_network("net1", &[IpamData::new("10.0.1.0/24".parse()?, "10.0.1.1/24".parse()?)], &[])
//!     .await?;
//! driver.join("net1").await?;
//! driver.leave("net1").await?;
//! driver.delete_network("net1").await?;
//! ```

use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use tracing::{debug, info};

use crate::config::OverlayConfig;
use crate::context::OverlayContext;
use crate::error::{OverlayError, Result};
use crate::idm::{IdAllocator, VniPool};
use crate::network::{Network, Subnet};
use crate::peer::{PeerResolver, PeerTable};
use crate::registry::NetworkRegistry;
use crate::sandbox::{SandboxProvider, VxlanLinks};
use crate::store::{get_object, KvStore, StoreError};

/// One address pool handed over by IPAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpamData {
    /// Pool CIDR.
    pub pool: IpNet,
    /// Gateway address with prefix.
    pub gateway: IpNet,
}

impl IpamData {
    /// Creates a pool descriptor.
    #[must_use]
    pub fn new(pool: IpNet, gateway: IpNet) -> Self {
        Self { pool, gateway }
    }

    fn to_subnet(self) -> Result<Subnet> {
        match (self.pool, self.gateway) {
            (IpNet::V4(pool), IpNet::V4(gateway)) => Ok(Subnet::new(pool, gateway)),
            _ => Err(OverlayError::InvalidArgument(format!(
                "pool {} with gateway {} is not an ipv4 pool",
                self.pool, self.gateway
            ))),
        }
    }
}

/// Manages overlay networks for one process.
#[derive(Debug)]
pub struct OverlayDriver {
    ctx: Arc<OverlayContext>,
    registry: NetworkRegistry,
}

impl OverlayDriver {
    /// Starts building a driver.
    #[must_use]
    pub fn builder() -> OverlayDriverBuilder {
        OverlayDriverBuilder::default()
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &OverlayConfig {
        &self.ctx.config
    }

    /// Creates a network, or adopts the record another process already wrote.
    ///
    /// A network already registered here is returned as is. IPv6 pools are
    /// accepted and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidArgument`] for an empty id, no IPv4
    /// pools, or an id that is being deleted;
    /// [`OverlayError::StoreConflict`] when store retries run out; and
    /// [`OverlayError::Store`] for other store failures.
    pub async fn create_network(
        &self,
        id: &str,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> Result<Arc<Network>> {
        if id.is_empty() {
            return Err(OverlayError::InvalidArgument("invalid network id".to_string()));
        }
        if ipv4.is_empty() {
            return Err(OverlayError::InvalidArgument(format!(
                "network {id} has no ipv4 pools"
            )));
        }
        if let Some(existing) = self.registry.lookup(id) {
            debug!(network = %id, "network already registered");
            return Ok(existing);
        }
        if !ipv6.is_empty() {
            debug!(network = %id, pools = ipv6.len(), "ignoring ipv6 pools");
        }

        let epoch = self.registry.deletion_epoch();
        if self.registry.is_deleting(id) {
            return Err(being_deleted(id));
        }

        let subnets = ipv4
            .iter()
            .map(|data| data.to_subnet())
            .collect::<Result<Vec<_>>>()?;
        let network = Arc::new(Network::new(id, Arc::clone(&self.ctx), subnets));
        network.write_if_absent().await?;

        let registered = self
            .registry
            .add_if_absent(network, epoch)
            .ok_or_else(|| being_deleted(id))?;
        info!(network = %id, subnets = registered.subnets().len(), "network created");
        Ok(registered)
    }

    /// Deletes a network: tears down its sandbox, removes its store record
    /// and releases its VNIs.
    ///
    /// The id cannot be registered again, by create or by rehydration, until
    /// the deletion has finished.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidArgument`] for an empty id,
    /// [`OverlayError::NotFound`] if the network is not registered, and
    /// [`OverlayError::Store`] if the record cannot be deleted.
    pub async fn delete_network(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(OverlayError::InvalidArgument("invalid network id".to_string()));
        }
        let deletion = self
            .registry
            .begin_delete(id)
            .ok_or_else(|| OverlayError::NotFound(id.to_string()))?;

        let network = deletion.network();
        network.shutdown().await;
        network.release_vxlan_id().await?;
        info!(network = %id, "network deleted");
        Ok(())
    }

    /// Joins network `id` through its first subnet.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if the network is unknown here and
    /// in the store, and any sandbox or VNI failure of the join.
    pub async fn join(&self, id: &str) -> Result<()> {
        self.network_or_rehydrate(id).await?.join().await
    }

    /// Joins network `id` through the subnet containing `address`.
    ///
    /// # Errors
    ///
    /// As [`OverlayDriver::join`], plus [`OverlayError::InvalidArgument`]
    /// when no subnet contains `address`.
    pub async fn join_endpoint(&self, id: &str, address: Ipv4Net) -> Result<()> {
        self.network_or_rehydrate(id)
            .await?
            .join_endpoint(Some(address))
            .await
    }

    /// Releases one join on network `id`.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] for an unknown network and
    /// [`OverlayError::InvalidArgument`] if nobody has joined.
    pub async fn leave(&self, id: &str) -> Result<()> {
        self.network_or_rehydrate(id).await?.leave().await
    }

    /// Registered network with `id`.
    #[must_use]
    pub fn network(&self, id: &str) -> Option<Arc<Network>> {
        self.registry.lookup(id)
    }

    /// Ids of all registered networks.
    #[must_use]
    pub fn network_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// Loads network `id` from the store and registers it unless an entry
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if the store has no record or the
    /// network is being deleted, [`OverlayError::Store`] if the record cannot
    /// be read or decoded, and [`OverlayError::StoreConflict`] if deletions
    /// keep racing the load.
    pub async fn create_network_from_store(&self, id: &str) -> Result<Arc<Network>> {
        if id.is_empty() {
            return Err(OverlayError::InvalidArgument("invalid network id".to_string()));
        }
        let attempts = self.ctx.config.retry.max_attempts;
        for attempt in 1..=attempts {
            let epoch = self.registry.deletion_epoch();
            if self.registry.is_deleting(id) {
                return Err(OverlayError::NotFound(id.to_string()));
            }

            let network = Arc::new(Network::new(id, Arc::clone(&self.ctx), Vec::new()));
            match get_object(&*self.ctx.store, &*network).await {
                Ok(()) => {}
                Err(StoreError::KeyNotFound) => return Err(OverlayError::NotFound(id.to_string())),
                Err(e) => return Err(OverlayError::store("read network", id, e)),
            }

            if let Some(registered) = self.registry.add_if_absent(network, epoch) {
                debug!(network = %id, subnets = registered.subnets().len(), "network loaded from store");
                return Ok(registered);
            }
            debug!(network = %id, attempt, "deletion raced network load, reloading");
        }
        Err(OverlayError::StoreConflict {
            network: id.to_string(),
            attempts,
        })
    }

    async fn network_or_rehydrate(&self, id: &str) -> Result<Arc<Network>> {
        match self.registry.lookup(id) {
            Some(network) => Ok(network),
            None => self.create_network_from_store(id).await,
        }
    }
}

fn being_deleted(id: &str) -> OverlayError {
    OverlayError::InvalidArgument(format!("network {id} is being deleted"))
}

/// Builder for [`OverlayDriver`].
///
/// The VNI allocator defaults to an in-process [`VniPool`] over the
/// configured range; every other collaborator is required.
#[derive(Default)]
pub struct OverlayDriverBuilder {
    config: OverlayConfig,
    store: Option<Arc<dyn KvStore>>,
    vxlan_idm: Option<Arc<dyn IdAllocator>>,
    sandboxes: Option<Arc<dyn SandboxProvider>>,
    links: Option<Arc<dyn VxlanLinks>>,
    resolver: Option<Arc<dyn PeerResolver>>,
    peers: Option<Arc<dyn PeerTable>>,
}

impl std::fmt::Debug for OverlayDriverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayDriverBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OverlayDriverBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: OverlayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the record store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the cluster VNI allocator.
    #[must_use]
    pub fn vxlan_idm(mut self, idm: Arc<dyn IdAllocator>) -> Self {
        self.vxlan_idm = Some(idm);
        self
    }

    /// Sets the sandbox provider.
    #[must_use]
    pub fn sandboxes(mut self, sandboxes: Arc<dyn SandboxProvider>) -> Self {
        self.sandboxes = Some(sandboxes);
        self
    }

    /// Sets the VXLAN link manager.
    #[must_use]
    pub fn links(mut self, links: Arc<dyn VxlanLinks>) -> Self {
        self.links = Some(links);
        self
    }

    /// Sets the peer resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn PeerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the peer table.
    #[must_use]
    pub fn peers(mut self, peers: Arc<dyn PeerTable>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Uses one peer database as both resolver and table.
    #[must_use]
    pub fn peer_db<P>(self, db: Arc<P>) -> Self
    where
        P: PeerResolver + PeerTable + 'static,
    {
        self.resolver(Arc::clone(&db) as Arc<dyn PeerResolver>)
            .peers(db)
    }

    /// Validates the configuration and builds the driver.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Config`] if the configuration is invalid or a
    /// required collaborator is missing.
    pub fn build(self) -> Result<OverlayDriver> {
        self.config.validate()?;

        let vxlan_idm = match self.vxlan_idm {
            Some(idm) => idm,
            None => {
                let range = &self.config.vni_range;
                let pool = VniPool::new(range.start, range.end)
                    .map_err(|e| OverlayError::Config(e.to_string()))?;
                Arc::new(pool)
            }
        };

        let ctx = OverlayContext {
            store: required(self.store, "store")?,
            vxlan_idm,
            sandboxes: required(self.sandboxes, "sandbox provider")?,
            links: required(self.links, "vxlan link manager")?,
            resolver: required(self.resolver, "peer resolver")?,
            peers: required(self.peers, "peer table")?,
            config: self.config,
        };

        Ok(OverlayDriver {
            ctx: Arc::new(ctx),
            registry: NetworkRegistry::new(),
        })
    }
}

fn required<T: ?Sized>(value: Option<Arc<T>>, what: &str) -> Result<Arc<T>> {
    value.ok_or_else(|| OverlayError::Config(format!("{what} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VniRange;
    use crate::peer::MemoryPeerDb;
    use crate::sandbox::{MemorySandboxProvider, MemoryVxlanLinks};
    use crate::store::MemoryStore;

    struct Harness {
        driver: OverlayDriver,
        store: Arc<MemoryStore>,
        sandboxes: Arc<MemorySandboxProvider>,
        links: Arc<MemoryVxlanLinks>,
        idm: Arc<VniPool>,
    }

    fn harness_on(store: Arc<MemoryStore>, idm: Arc<VniPool>) -> Harness {
        let sandboxes = Arc::new(MemorySandboxProvider::new());
        let links = Arc::new(MemoryVxlanLinks::new());
        let driver = OverlayDriver::builder()
            .store(store.clone())
            .vxlan_idm(idm.clone())
            .sandboxes(sandboxes.clone())
            .links(links.clone())
            .peer_db(Arc::new(MemoryPeerDb::new()))
            .build()
            .expect("driver");
        Harness {
            driver,
            store,
            sandboxes,
            links,
            idm,
        }
    }

    fn harness() -> Harness {
        harness_on(
            Arc::new(MemoryStore::new()),
            Arc::new(VniPool::new(4096, 8191).expect("range")),
        )
    }

    fn v4(pool: &str, gw: &str) -> IpamData {
        IpamData::new(pool.parse().expect("pool"), gw.parse().expect("gateway"))
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let h = harness();
        let err = h.driver.create_network("", &[v4("10.0.1.0/24", "10.0.1.1/24")], &[]).await;
        assert!(matches!(err, Err(OverlayError::InvalidArgument(msg)) if msg == "invalid network id"));

        let err = h.driver.create_network("net1", &[], &[]).await;
        assert!(matches!(err, Err(OverlayError::InvalidArgument(_))));

        let err = h
            .driver
            .create_network("net1", &[v4("fd00::/64", "fd00::1/64")], &[])
            .await;
        assert!(matches!(err, Err(OverlayError::InvalidArgument(_))));
        assert!(h.driver.network_ids().is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_create_ignores_ipv6_pools() {
        let h = harness();
        let network = h
            .driver
            .create_network(
                "net1",
                &[v4("10.0.1.0/24", "10.0.1.1/24")],
                &[v4("fd00::/64", "fd00::1/64")],
            )
            .await
            .expect("create");
        assert_eq!(network.subnets().len(), 1);
        assert_eq!(h.driver.network_ids(), vec!["net1"]);
    }

    #[tokio::test]
    async fn test_create_again_keeps_joined_network() {
        let h = harness();
        let first = h
            .driver
            .create_network("net1", &[v4("10.0.1.0/24", "10.0.1.1/24")], &[])
            .await
            .expect("create");
        h.driver.join("net1").await.expect("join");

        let again = h
            .driver
            .create_network("net1", &[v4("10.0.1.0/24", "10.0.1.1/24")], &[])
            .await
            .expect("create again");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.join_count(), 1);

        h.driver.leave("net1").await.expect("leave");
        assert!(h.sandboxes.live_sandboxes().is_empty());
        assert!(h.links.is_empty());
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let h = harness();
        h.driver
            .create_network("net1", &[v4("10.0.1.0/24", "10.0.1.1/24")], &[])
            .await
            .expect("create");
        h.driver.delete_network("net1").await.expect("delete");
        assert!(h.store.is_empty());
        assert!(matches!(
            h.driver.delete_network("net1").await,
            Err(OverlayError::NotFound(_))
        ));
        assert!(matches!(
            h.driver.delete_network("").await,
            Err(OverlayError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_with_active_joiners_tears_down() {
        let h = harness();
        h.driver
            .create_network("net1", &[v4("10.0.1.0/24", "10.0.1.1/24")], &[])
            .await
            .expect("create");
        h.driver.join("net1").await.expect("join");
        let vni = h.driver.network("net1").expect("registered").subnets()[0].vni();
        assert!(h.idm.is_allocated(vni));

        h.driver.delete_network("net1").await.expect("delete");
        assert!(h.sandboxes.live_sandboxes().is_empty());
        assert!(h.links.is_empty());
        assert!(!h.idm.is_allocated(vni));
        assert!(h.driver.network("net1").is_none());
    }

    #[tokio::test]
    async fn test_join_unknown_network() {
        let h = harness();
        assert!(matches!(h.driver.join("nope").await, Err(OverlayError::NotFound(_))));
        assert!(matches!(h.driver.leave("nope").await, Err(OverlayError::NotFound(_))));
        assert!(h.driver.network_ids().is_empty());
    }

    #[tokio::test]
    async fn test_join_rehydrates_network_created_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let idm = Arc::new(VniPool::new(4096, 8191).expect("range"));
        let a = harness_on(store.clone(), idm.clone());
        let b = harness_on(store, idm);

        a.driver
            .create_network("net1", &[v4("10.0.1.0/24", "10.0.1.1/24")], &[])
            .await
            .expect("create");
        a.driver.join("net1").await.expect("join on a");

        b.driver.join("net1").await.expect("join on b");
        let on_a = a.driver.network("net1").expect("a").subnets()[0].vni();
        let on_b = b.driver.network("net1").expect("b").subnets()[0].vni();
        assert_eq!(on_a, on_b);
        assert_eq!(b.driver.network_ids(), vec!["net1"]);
    }

    #[tokio::test]
    async fn test_create_network_from_store_missing() {
        let h = harness();
        assert!(matches!(
            h.driver.create_network_from_store("net9").await,
            Err(OverlayError::NotFound(_))
        ));
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = OverlayDriver::builder().build().expect_err("no store");
        assert!(matches!(err, OverlayError::Config(msg) if msg == "store is required"));

        let err = OverlayDriver::builder()
            .store(Arc::new(MemoryStore::new()))
            .sandboxes(Arc::new(MemorySandboxProvider::new()))
            .links(Arc::new(MemoryVxlanLinks::new()))
            .build()
            .expect_err("no peers");
        assert!(matches!(err, OverlayError::Config(_)));
    }

    #[test]
    fn test_builder_validates_config() {
        let config = OverlayConfig {
            vni_range: VniRange { start: 10, end: 5 },
            ..OverlayConfig::default()
        };
        let err = OverlayDriver::builder()
            .config(config)
            .store(Arc::new(MemoryStore::new()))
            .sandboxes(Arc::new(MemorySandboxProvider::new()))
            .links(Arc::new(MemoryVxlanLinks::new()))
            .peer_db(Arc::new(MemoryPeerDb::new()))
            .build()
            .expect_err("bad range");
        assert!(matches!(err, OverlayError::Config(_)));
    }
}
