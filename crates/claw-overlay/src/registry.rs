//! In-process index of known networks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::network::Network;

#[derive(Debug, Default)]
struct Entries {
    networks: HashMap<String, Arc<Network>>,
    deleting: HashSet<String>,
    deletions: u64,
}

/// Maps network ids to their entities.
///
/// Holds at most one entry per id. Lookups never block on I/O. An id being
/// deleted cannot be registered again until its [`Deletion`] is dropped.
#[derive(Debug, Default)]
pub struct NetworkRegistry {
    entries: RwLock<Entries>,
}

impl NetworkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `network`, returning the entry it replaced.
    ///
    /// Returns `Err(network)` without registering while the id is being
    /// deleted.
    pub fn add(&self, network: Arc<Network>) -> Result<Option<Arc<Network>>, Arc<Network>> {
        let mut entries = self.entries.write();
        if entries.deleting.contains(network.id()) {
            return Err(network);
        }
        Ok(entries.networks.insert(network.id().to_string(), network))
    }

    /// Registers `network` unless an entry already exists, returning the
    /// registered entry.
    ///
    /// With no entry present, registration is refused (`None`) while the id
    /// is being deleted or if any deletion started after `epoch` was read
    /// from [`NetworkRegistry::deletion_epoch`].
    pub fn add_if_absent(&self, network: Arc<Network>, epoch: u64) -> Option<Arc<Network>> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.networks.get(network.id()) {
            return Some(Arc::clone(existing));
        }
        if entries.deleting.contains(network.id()) || entries.deletions != epoch {
            return None;
        }
        entries
            .networks
            .insert(network.id().to_string(), Arc::clone(&network));
        Some(network)
    }

    /// Counter bumped every time a deletion starts.
    #[must_use]
    pub fn deletion_epoch(&self) -> u64 {
        self.entries.read().deletions
    }

    /// Unregisters the network with `id` and blocks re-registration until
    /// the returned guard is dropped.
    #[must_use]
    pub fn begin_delete(&self, id: &str) -> Option<Deletion<'_>> {
        let mut entries = self.entries.write();
        let network = entries.networks.remove(id)?;
        entries.deleting.insert(id.to_string());
        entries.deletions += 1;
        Some(Deletion {
            registry: self,
            network,
        })
    }

    /// Returns true while a deletion of `id` is in progress.
    #[must_use]
    pub fn is_deleting(&self, id: &str) -> bool {
        self.entries.read().deleting.contains(id)
    }

    /// Looks up the network with `id`.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<Network>> {
        self.entries.read().networks.get(id).cloned()
    }

    /// Number of registered networks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().networks.len()
    }

    /// Returns true if no network is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().networks.is_empty()
    }

    /// Ids of all registered networks, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().networks.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// An in-progress deletion. Dropping it lets the id be registered again.
#[derive(Debug)]
pub struct Deletion<'a> {
    registry: &'a NetworkRegistry,
    network: Arc<Network>,
}

impl Deletion<'_> {
    /// The unregistered network.
    #[must_use]
    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }
}

impl Drop for Deletion<'_> {
    fn drop(&mut self) {
        self.registry
            .entries
            .write()
            .deleting
            .remove(self.network.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;

    fn network(id: &str) -> Arc<Network> {
        let (ctx, _) = testing::context();
        Arc::new(Network::new(id, ctx, Vec::new()))
    }

    #[test]
    fn test_add_lookup_delete() {
        let registry = NetworkRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.add(network("net1")).expect("not deleting").is_none());
        assert!(registry.add(network("net2")).expect("not deleting").is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["net1", "net2"]);
        assert_eq!(registry.lookup("net1").map(|n| n.id().to_string()), Some("net1".into()));

        let deletion = registry.begin_delete("net1").expect("registered");
        assert_eq!(deletion.network().id(), "net1");
        assert!(registry.lookup("net1").is_none());
        assert!(registry.begin_delete("net1").is_none());
        assert_eq!(registry.len(), 1);
        drop(deletion);
        assert!(!registry.is_deleting("net1"));
    }

    #[test]
    fn test_add_replaces_same_id() {
        let registry = NetworkRegistry::new();
        let first = network("net1");
        let second = network("net1");
        registry.add(Arc::clone(&first)).expect("not deleting");
        let replaced = registry
            .add(Arc::clone(&second))
            .expect("not deleting")
            .expect("previous entry");
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&registry.lookup("net1").expect("entry"), &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_if_absent_keeps_existing() {
        let registry = NetworkRegistry::new();
        let first = network("net1");
        registry.add(Arc::clone(&first)).expect("not deleting");
        let kept = registry
            .add_if_absent(network("net1"), registry.deletion_epoch())
            .expect("registered");
        assert!(Arc::ptr_eq(&kept, &first));
    }

    #[test]
    fn test_registration_blocked_while_deleting() {
        let registry = NetworkRegistry::new();
        registry.add(network("net1")).expect("not deleting");

        let deletion = registry.begin_delete("net1").expect("registered");
        assert!(registry.is_deleting("net1"));
        assert!(registry.add(network("net1")).is_err());
        assert!(registry
            .add_if_absent(network("net1"), registry.deletion_epoch())
            .is_none());
        assert!(registry.add(network("net2")).is_ok());

        drop(deletion);
        assert!(registry.add(network("net1")).is_ok());
    }

    #[test]
    fn test_add_if_absent_refuses_stale_epoch() {
        let registry = NetworkRegistry::new();
        registry.add(network("net1")).expect("not deleting");
        let epoch = registry.deletion_epoch();

        drop(registry.begin_delete("net1").expect("registered"));
        assert!(!registry.is_deleting("net1"));
        assert!(registry.add_if_absent(network("net1"), epoch).is_none());

        let fresh = registry.deletion_epoch();
        assert_ne!(fresh, epoch);
        assert!(registry.add_if_absent(network("net1"), fresh).is_some());
    }

    #[test]
    fn test_concurrent_access() {
        let registry = Arc::new(NetworkRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let id = format!("net{i}");
                    registry.add(network(&id)).expect("not deleting");
                    assert!(registry.lookup(&id).is_some());
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }
        assert_eq!(registry.len(), 8);
    }
}
