//! Test helpers for overlay integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use claw_overlay::{
    BoxFuture, IpamData, KvPair, KvStore, MemoryPeerDb, MemorySandboxProvider, MemoryStore,
    MemoryVxlanLinks, OverlayConfig, OverlayDriver, RetryPolicy, StoreKey, StoreResult, VniPool,
};
use tokio::sync::{Barrier, Notify};

/// Default test timeout.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One simulated host: a driver with its own sandboxes and links, sharing the
/// store and allocator with its peers.
pub struct TestNode {
    pub driver: OverlayDriver,
    pub sandboxes: Arc<MemorySandboxProvider>,
    pub links: Arc<MemoryVxlanLinks>,
    pub peers: Arc<MemoryPeerDb>,
}

impl TestNode {
    pub fn new(store: Arc<dyn KvStore>, idm: Arc<VniPool>) -> Self {
        Self::with_sandboxes(store, idm, MemorySandboxProvider::new())
    }

    pub fn with_sandboxes(
        store: Arc<dyn KvStore>,
        idm: Arc<VniPool>,
        sandboxes: MemorySandboxProvider,
    ) -> Self {
        let sandboxes = Arc::new(sandboxes);
        let links = Arc::new(MemoryVxlanLinks::new());
        let peers = Arc::new(MemoryPeerDb::new());
        let driver = OverlayDriver::builder()
            .config(fast_retry_config())
            .store(store)
            .vxlan_idm(idm)
            .sandboxes(sandboxes.clone())
            .links(links.clone())
            .peer_db(peers.clone())
            .build()
            .expect("driver builds");
        Self {
            driver,
            sandboxes,
            links,
            peers,
        }
    }
}

/// A single node on a fresh store and a VNI pool starting at 4096.
pub fn single_node() -> (TestNode, Arc<MemoryStore>, Arc<VniPool>) {
    let store = Arc::new(MemoryStore::new());
    let idm = vni_pool();
    let node = TestNode::new(store.clone(), idm.clone());
    (node, store, idm)
}

pub fn vni_pool() -> Arc<VniPool> {
    Arc::new(VniPool::new(4096, 8191).expect("valid range"))
}

pub fn fast_retry_config() -> OverlayConfig {
    OverlayConfig {
        retry: RetryPolicy {
            max_attempts: 8,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        ..OverlayConfig::default()
    }
}

/// IPv4 pool descriptor from CIDR strings.
pub fn v4(pool: &str, gateway: &str) -> IpamData {
    IpamData::new(
        pool.parse().expect("pool cidr"),
        gateway.parse().expect("gateway cidr"),
    )
}

/// Store wrapper whose next `n` writes wait for each other before hitting the
/// inner store, forcing their reads to interleave.
pub struct RendezvousStore {
    inner: Arc<MemoryStore>,
    barrier: Barrier,
    remaining: AtomicUsize,
}

impl RendezvousStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            barrier: Barrier::new(2),
            remaining: AtomicUsize::new(0),
        }
    }

    /// Makes the next two writes meet at the barrier.
    pub fn arm(&self) {
        self.remaining.store(2, Ordering::SeqCst);
    }

    fn take_slot(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl KvStore for RendezvousStore {
    fn get<'a>(&'a self, key: &'a StoreKey) -> BoxFuture<'a, StoreResult<KvPair>> {
        self.inner.get(key)
    }

    fn put_if_unchanged<'a>(
        &'a self,
        key: &'a StoreKey,
        value: Vec<u8>,
        previous: Option<u64>,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move {
            if self.take_slot() {
                self.barrier.wait().await;
            }
            self.inner.put_if_unchanged(key, value, previous).await
        })
    }

    fn delete_if_unchanged<'a>(&'a self, key: &'a StoreKey, index: u64) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.delete_if_unchanged(key, index)
    }
}

/// Store wrapper that fails every write with a conflict.
pub struct ContendedStore {
    pub inner: Arc<MemoryStore>,
    pub writes: AtomicUsize,
}

impl KvStore for ContendedStore {
    fn get<'a>(&'a self, key: &'a StoreKey) -> BoxFuture<'a, StoreResult<KvPair>> {
        self.inner.get(key)
    }

    fn put_if_unchanged<'a>(
        &'a self,
        _key: &'a StoreKey,
        _value: Vec<u8>,
        _previous: Option<u64>,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(claw_overlay::StoreError::KeyModified) })
    }

    fn delete_if_unchanged<'a>(&'a self, key: &'a StoreKey, index: u64) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.delete_if_unchanged(key, index)
    }
}

/// Store wrapper that holds record deletions until released, so other
/// operations can run while a delete is in flight.
pub struct PausedDeleteStore {
    pub inner: Arc<MemoryStore>,
    pub deleting: Notify,
    pub release: Notify,
}

impl PausedDeleteStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            deleting: Notify::new(),
            release: Notify::new(),
        }
    }
}

impl KvStore for PausedDeleteStore {
    fn get<'a>(&'a self, key: &'a StoreKey) -> BoxFuture<'a, StoreResult<KvPair>> {
        self.inner.get(key)
    }

    fn put_if_unchanged<'a>(
        &'a self,
        key: &'a StoreKey,
        value: Vec<u8>,
        previous: Option<u64>,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        self.inner.put_if_unchanged(key, value, previous)
    }

    fn delete_if_unchanged<'a>(&'a self, key: &'a StoreKey, index: u64) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.deleting.notify_one();
            self.release.notified().await;
            self.inner.delete_if_unchanged(key, index).await
        })
    }
}
