//! Network sandbox and VXLAN link collaborators.
//!
//! A sandbox is the isolated network namespace holding one overlay network's
//! bridges and VXLAN devices. The core only needs to create one, add and list
//! interfaces, subscribe to its neighbor table and destroy it; the namespace
//! primitive itself lives behind [`SandboxProvider`] and [`Sandbox`].
//!
//! VXLAN devices are created on the host by [`VxlanLinks`] and then moved into
//! the sandbox with [`Sandbox::add_interface`].
//!
//! The `Memory*` types implement the traits in-process for tests and for
//! hosts where no real namespace support is wanted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::{OverlayError, Result};
use crate::neighbor::{NeighborMessage, NeighborSubscription};
use crate::BoxFuture;

/// Directory holding sandbox namespace handles.
pub const SANDBOX_KEY_DIR: &str = "/var/run/claw/netns";

const SANDBOX_KEY_MAX_LEN: usize = 12;

/// Kind of interface inside a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// Linux bridge.
    Bridge,
    /// VXLAN tunnel device.
    Vxlan,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "br"),
            Self::Vxlan => write!(f, "vxlan"),
        }
    }
}

/// Options applied when adding an interface to a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceOptions {
    /// Address assigned to the interface.
    pub address: Option<Ipv4Net>,
    /// Create the interface as a bridge.
    pub bridge: bool,
    /// Bridge the interface is enslaved to.
    pub master: Option<String>,
}

impl InterfaceOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the interface address.
    #[must_use]
    pub fn address(mut self, address: Ipv4Net) -> Self {
        self.address = Some(address);
        self
    }

    /// Marks the interface as a bridge.
    #[must_use]
    pub fn bridge(mut self, bridge: bool) -> Self {
        self.bridge = bridge;
        self
    }

    /// Enslaves the interface to `master`.
    #[must_use]
    pub fn master(mut self, master: impl Into<String>) -> Self {
        self.master = Some(master.into());
        self
    }
}

/// An interface living in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface name.
    pub name: String,
    /// Interface kind.
    pub kind: InterfaceKind,
    /// Options it was created with.
    pub options: InterfaceOptions,
}

/// An isolated network namespace.
pub trait Sandbox: Send + Sync + fmt::Debug {
    /// Key the sandbox was created under.
    fn key(&self) -> &str;

    /// Creates or moves an interface into the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the interface cannot be set up.
    fn add_interface<'a>(
        &'a self,
        name: &'a str,
        kind: InterfaceKind,
        options: InterfaceOptions,
    ) -> BoxFuture<'a, Result<()>>;

    /// Interfaces currently in the sandbox, in creation order.
    fn interfaces(&self) -> Vec<InterfaceInfo>;

    /// Removes an interface.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the interface cannot be removed.
    fn remove_interface<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Subscribes to neighbor-table notifications from inside the namespace.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the subscription cannot be opened.
    fn subscribe_neighbors(&self) -> BoxFuture<'_, Result<Box<dyn NeighborSubscription>>>;

    /// Tears the namespace down. Open neighbor subscriptions close.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the namespace cannot be removed.
    fn destroy(&self) -> BoxFuture<'_, Result<()>>;
}

/// Creates sandboxes.
pub trait SandboxProvider: Send + Sync {
    /// Derives a sandbox key from `seed`.
    fn generate_key(&self, seed: &str) -> String {
        let end = seed
            .char_indices()
            .nth(SANDBOX_KEY_MAX_LEN)
            .map_or(seed.len(), |(i, _)| i);
        format!("{SANDBOX_KEY_DIR}/{}", &seed[..end])
    }

    /// Creates a sandbox under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the namespace cannot be created.
    fn create<'a>(
        &'a self,
        key: &'a str,
        is_overlay: bool,
    ) -> BoxFuture<'a, Result<Arc<dyn Sandbox>>>;
}

/// Creates and deletes VXLAN devices on the host.
pub trait VxlanLinks: Send + Sync {
    /// Creates a VXLAN device for `vni` and returns its name.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the device cannot be created.
    fn create_vxlan(&self, vni: u32) -> BoxFuture<'_, Result<String>>;

    /// Deletes a VXLAN device.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Sandbox`] if the device cannot be deleted.
    fn delete_vxlan<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Generates an interface name: `prefix` followed by `len` random alphanumerics.
#[must_use]
pub fn generate_iface_name(prefix: &str, len: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

type NeighborBatch = Result<Vec<NeighborMessage>>;

/// In-process sandbox.
#[derive(Debug)]
pub struct MemorySandbox {
    key: String,
    is_overlay: bool,
    interfaces: Mutex<Vec<InterfaceInfo>>,
    removed: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NeighborBatch>>>,
    fail_interfaces: Mutex<Option<String>>,
    destroyed: AtomicBool,
}

impl MemorySandbox {
    fn new(key: &str, is_overlay: bool, fail_interfaces: Option<String>) -> Self {
        Self {
            key: key.to_string(),
            is_overlay,
            interfaces: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            fail_interfaces: Mutex::new(fail_interfaces),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Whether the sandbox was created for an overlay network.
    #[must_use]
    pub fn is_overlay(&self) -> bool {
        self.is_overlay
    }

    /// Returns true once [`Sandbox::destroy`] has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Names of removed interfaces, in removal order.
    #[must_use]
    pub fn removed_interfaces(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    /// Number of live neighbor subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Delivers a batch of notifications to every subscriber.
    pub fn inject_neighbors(&self, batch: Vec<NeighborMessage>) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(Ok(batch.clone())).is_ok());
    }

    /// Delivers a receive error to every subscriber.
    pub fn inject_receive_error(&self, reason: &str) {
        self.subscribers.lock().retain(|tx| {
            tx.send(Err(OverlayError::Sandbox(reason.to_string())))
                .is_ok()
        });
    }
}

impl Sandbox for MemorySandbox {
    fn key(&self) -> &str {
        &self.key
    }

    fn add_interface<'a>(
        &'a self,
        name: &'a str,
        kind: InterfaceKind,
        options: InterfaceOptions,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.is_destroyed() {
                return Err(OverlayError::Sandbox(format!(
                    "sandbox {} is destroyed",
                    self.key
                )));
            }
            if let Some(reason) = self.fail_interfaces.lock().clone() {
                return Err(OverlayError::Sandbox(reason));
            }
            let mut interfaces = self.interfaces.lock();
            if interfaces.iter().any(|i| i.name == name) {
                return Err(OverlayError::Sandbox(format!(
                    "interface {name} already exists in {}",
                    self.key
                )));
            }
            if let Some(master) = &options.master {
                if !interfaces.iter().any(|i| &i.name == master) {
                    return Err(OverlayError::Sandbox(format!(
                        "master {master} not found in {}",
                        self.key
                    )));
                }
            }
            interfaces.push(InterfaceInfo {
                name: name.to_string(),
                kind,
                options,
            });
            Ok(())
        })
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.lock().clone()
    }

    fn remove_interface<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut interfaces = self.interfaces.lock();
            let before = interfaces.len();
            interfaces.retain(|i| i.name != name);
            if interfaces.len() == before {
                return Err(OverlayError::Sandbox(format!(
                    "interface {name} not found in {}",
                    self.key
                )));
            }
            self.removed.lock().push(name.to_string());
            Ok(())
        })
    }

    fn subscribe_neighbors(&self) -> BoxFuture<'_, Result<Box<dyn NeighborSubscription>>> {
        Box::pin(async move {
            if self.is_destroyed() {
                return Err(OverlayError::Sandbox(format!(
                    "sandbox {} is destroyed",
                    self.key
                )));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribers.lock().push(tx);
            Ok(Box::new(MemoryNeighborSubscription { rx }) as Box<dyn NeighborSubscription>)
        })
    }

    fn destroy(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return Err(OverlayError::Sandbox(format!(
                    "sandbox {} already destroyed",
                    self.key
                )));
            }
            self.interfaces.lock().clear();
            // Dropping the senders closes every subscription.
            self.subscribers.lock().clear();
            Ok(())
        })
    }
}

struct MemoryNeighborSubscription {
    rx: mpsc::UnboundedReceiver<NeighborBatch>,
}

impl NeighborSubscription for MemoryNeighborSubscription {
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<NeighborMessage>>>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(batch)) => Ok(Some(batch)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }
}

/// In-process [`SandboxProvider`] recording every sandbox it creates.
#[derive(Debug, Default)]
pub struct MemorySandboxProvider {
    sandboxes: Mutex<HashMap<String, Arc<MemorySandbox>>>,
    created: AtomicUsize,
    create_delay: Option<Duration>,
    fail_create: Mutex<Option<String>>,
    fail_interfaces: Mutex<Option<String>>,
}

impl MemorySandboxProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every sandbox creation take `delay`, widening race windows in tests.
    #[must_use]
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Makes sandbox creation fail with `reason` until cleared with `None`.
    pub fn set_create_failure(&self, reason: Option<&str>) {
        *self.fail_create.lock() = reason.map(str::to_string);
    }

    /// Makes `add_interface` fail on sandboxes created from now on.
    pub fn set_interface_failure(&self, reason: Option<&str>) {
        *self.fail_interfaces.lock() = reason.map(str::to_string);
    }

    /// Number of sandbox creation attempts, including failed ones.
    #[must_use]
    pub fn create_attempts(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Sandbox created under `key`, destroyed or not.
    #[must_use]
    pub fn sandbox(&self, key: &str) -> Option<Arc<MemorySandbox>> {
        self.sandboxes.lock().get(key).cloned()
    }

    /// Sandboxes that have not been destroyed.
    #[must_use]
    pub fn live_sandboxes(&self) -> Vec<Arc<MemorySandbox>> {
        self.sandboxes
            .lock()
            .values()
            .filter(|s| !s.is_destroyed())
            .cloned()
            .collect()
    }
}

impl SandboxProvider for MemorySandboxProvider {
    fn create<'a>(
        &'a self,
        key: &'a str,
        is_overlay: bool,
    ) -> BoxFuture<'a, Result<Arc<dyn Sandbox>>> {
        Box::pin(async move {
            self.created.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(reason) = self.fail_create.lock().clone() {
                return Err(OverlayError::Sandbox(reason));
            }

            let mut sandboxes = self.sandboxes.lock();
            if sandboxes.get(key).is_some_and(|s| !s.is_destroyed()) {
                return Err(OverlayError::Sandbox(format!("sandbox {key} already exists")));
            }
            let sandbox = Arc::new(MemorySandbox::new(
                key,
                is_overlay,
                self.fail_interfaces.lock().clone(),
            ));
            sandboxes.insert(key.to_string(), Arc::clone(&sandbox));
            Ok(sandbox as Arc<dyn Sandbox>)
        })
    }
}

/// In-process [`VxlanLinks`] tracking device name to VNI.
#[derive(Debug, Default)]
pub struct MemoryVxlanLinks {
    links: Mutex<HashMap<String, u32>>,
    created: AtomicUsize,
}

impl MemoryVxlanLinks {
    /// Creates an empty link table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// VNI of the device named `name`.
    #[must_use]
    pub fn vni_of(&self, name: &str) -> Option<u32> {
        self.links.lock().get(name).copied()
    }

    /// Number of devices currently present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    /// Returns true if no devices are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    /// Number of devices ever created.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl VxlanLinks for MemoryVxlanLinks {
    fn create_vxlan(&self, vni: u32) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if vni == 0 {
                return Err(OverlayError::Sandbox(
                    "cannot create vxlan device without a vni".to_string(),
                ));
            }
            let mut links = self.links.lock();
            if links.values().any(|v| *v == vni) {
                return Err(OverlayError::Sandbox(format!(
                    "vxlan device for vni {vni} already exists"
                )));
            }
            let name = generate_iface_name("vxlan", 7);
            links.insert(name.clone(), vni);
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(name)
        })
    }

    fn delete_vxlan<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.links
                .lock()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| OverlayError::Sandbox(format!("vxlan device {name} not found")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbor::{NeighborEntry, NeighborMessageKind, NeighborState};
    use std::net::{IpAddr, Ipv4Addr};

    fn gw() -> Ipv4Net {
        "10.0.1.1/24".parse().expect("valid cidr")
    }

    #[test]
    fn test_generate_iface_name() {
        let name = generate_iface_name("bridge", 7);
        assert_eq!(name.len(), 13);
        assert!(name.starts_with("bridge"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(name, generate_iface_name("bridge", 7));
    }

    #[test]
    fn test_generate_key_truncates_seed() {
        let provider = MemorySandboxProvider::new();
        assert_eq!(provider.generate_key("1-net1"), "/var/run/claw/netns/1-net1");
        assert_eq!(
            provider.generate_key("12-0123456789abcdef"),
            "/var/run/claw/netns/12-012345678"
        );
    }

    #[tokio::test]
    async fn test_bridge_then_vxlan_with_master() {
        let provider = MemorySandboxProvider::new();
        let sandbox = provider.create("sb1", true).await.expect("create");

        sandbox
            .add_interface(
                "bridge1",
                InterfaceKind::Bridge,
                InterfaceOptions::new().address(gw()).bridge(true),
            )
            .await
            .expect("bridge");
        sandbox
            .add_interface(
                "vxlan1",
                InterfaceKind::Vxlan,
                InterfaceOptions::new().master("bridge1"),
            )
            .await
            .expect("vxlan");

        let names: Vec<String> = sandbox.interfaces().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["bridge1", "vxlan1"]);

        let orphan = sandbox
            .add_interface(
                "vxlan2",
                InterfaceKind::Vxlan,
                InterfaceOptions::new().master("missing"),
            )
            .await;
        assert!(orphan.is_err());
    }

    #[tokio::test]
    async fn test_remove_interface() {
        let provider = MemorySandboxProvider::new();
        let sandbox = provider.create("sb1", true).await.expect("create");
        sandbox
            .add_interface("bridge1", InterfaceKind::Bridge, InterfaceOptions::new())
            .await
            .expect("bridge");
        sandbox.remove_interface("bridge1").await.expect("remove");
        assert!(sandbox.interfaces().is_empty());
        assert!(sandbox.remove_interface("bridge1").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_live_key_rejected() {
        let provider = MemorySandboxProvider::new();
        let first = provider.create("sb1", true).await.expect("create");
        assert!(provider.create("sb1", true).await.is_err());

        first.destroy().await.expect("destroy");
        provider.create("sb1", true).await.expect("key reusable after destroy");
        assert_eq!(provider.create_attempts(), 3);
    }

    #[tokio::test]
    async fn test_create_failure_injection() {
        let provider = MemorySandboxProvider::new();
        provider.set_create_failure(Some("no netns support"));
        let err = provider.create("sb1", true).await.expect_err("should fail");
        assert_eq!(err.to_string(), "sandbox error: no netns support");

        provider.set_create_failure(None);
        assert!(provider.create("sb1", true).await.is_ok());
    }

    #[tokio::test]
    async fn test_neighbor_subscription_closes_on_destroy() {
        let provider = MemorySandboxProvider::new();
        provider.create("sb1", true).await.expect("create");
        let sandbox = provider.sandbox("sb1").expect("recorded");
        let mut sub = sandbox.subscribe_neighbors().await.expect("subscribe");

        let msg = NeighborMessage::new(
            NeighborMessageKind::Get,
            NeighborEntry {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 7)),
                state: NeighborState::INCOMPLETE,
                link_index: 3,
                mac: None,
            },
        );
        sandbox.inject_neighbors(vec![msg.clone()]);
        assert_eq!(sub.recv().await.expect("recv"), Some(vec![msg]));

        sandbox.inject_receive_error("ENOBUFS");
        assert!(sub.recv().await.is_err());

        sandbox.destroy().await.expect("destroy");
        assert_eq!(sub.recv().await.expect("closed"), None);
        assert!(provider.live_sandboxes().is_empty());
    }

    #[tokio::test]
    async fn test_memory_vxlan_links() {
        let links = MemoryVxlanLinks::new();
        assert!(links.create_vxlan(0).await.is_err());

        let name = links.create_vxlan(42).await.expect("create");
        assert_eq!(links.vni_of(&name), Some(42));
        assert!(links.create_vxlan(42).await.is_err(), "vni already bound");

        links.delete_vxlan(&name).await.expect("delete");
        assert!(links.is_empty());
        assert!(links.delete_vxlan(&name).await.is_err());
        assert_eq!(links.create_count(), 1);
    }
}
