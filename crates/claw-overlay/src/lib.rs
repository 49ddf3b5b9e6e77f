//! VXLAN overlay network lifecycle for Clawbernetes.
//!
//! This crate manages the per-host side of an overlay network:
//!
//! - **Persistence**: each network is one record in a shared key/value store,
//!   written with optimistic concurrency so cooperating hosts converge.
//! - **Sandboxes**: a network's namespace, bridges and VXLAN devices are built
//!   once, lazily, by the first joiner and torn down by the last leaver.
//! - **VNI allocation**: tunnel ids come from a cluster-wide allocator and are
//!   only kept once the store record carrying them has been written.
//! - **Neighbor misses**: a background watcher resolves addresses the kernel
//!   could not and programs the answer into the sandbox.
//!
//! External systems (store, allocator, namespaces, links, peer database) sit
//! behind traits with in-memory implementations for tests and single-host use.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use claw_overlay::{
//!     IpamData, MemoryPeerDb, MemorySandboxProvider, MemoryStore, MemoryVxlanLinks, OverlayDriver,
//! };
//!
//! let driver = OverlayDriver::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .sandboxes(Arc::new(MemorySandboxProvider::new()))
//!     .links(Arc::new(MemoryVxlanLinks::new()))
//!     .peer_db(Arc::new(MemoryPeerDb::new()))
//!     .build()?;
//!
//! let pool = IpamData::new("10.0.1.0/24".parse()?, "10.0.1.1/24".parse()?);
//! driver.create_network("net1", &[pool], &[]).await?;
//! driver.join("net1").await?;
//! ```
//!
//! # Feature flags
//!
//! - `netlink`: kernel neighbor subscription over an rtnetlink socket.

#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod gate;
pub mod idm;
pub mod neighbor;
#[cfg(feature = "netlink")]
pub mod netlink;
pub mod network;
pub mod peer;
pub mod registry;
pub mod sandbox;
pub mod store;
pub mod watcher;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use config::{OverlayConfig, RetryPolicy, VniRange};
pub use context::OverlayContext;
pub use driver::{IpamData, OverlayDriver, OverlayDriverBuilder};
pub use error::{OverlayError, Result};
pub use gate::InitGate;
pub use idm::{AllocatorError, IdAllocator, PoolStats, VniPool, VNI_MAX, VNI_MIN};
pub use neighbor::{
    NeighborEntry, NeighborMessage, NeighborMessageKind, NeighborState, NeighborSubscription,
};
pub use network::{Network, Subnet};
pub use peer::{MacAddress, MemoryPeerDb, PeerEntry, PeerRecord, PeerResolver, PeerTable};
pub use registry::{Deletion, NetworkRegistry};
pub use sandbox::{
    InterfaceInfo, InterfaceKind, InterfaceOptions, MemorySandbox, MemorySandboxProvider,
    MemoryVxlanLinks, Sandbox, SandboxProvider, VxlanLinks,
};
pub use store::{
    DataScope, KvObject, KvPair, KvStore, MemoryStore, StoreError, StoreKey, StoreResult,
};
pub use watcher::{MissOutcome, NeighborMissWatcher};
