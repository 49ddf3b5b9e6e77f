//! Overlay network and subnet entities.
//!
//! A [`Network`] aggregates one or more [`Subnet`]s, owns the network's
//! sandbox and join count, and persists itself as a single store record under
//! `overlay/network/<id>`. All mutable state sits behind one lock embedded in
//! the entity; the lock is never held across an `.await`.
//!
//! The sandbox lifecycle lives in [`lifecycle`], the VNI allocation protocol in
//! [`vni`].

mod lifecycle;
mod vni;

use std::fmt;
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::OverlayContext;
use crate::error::{OverlayError, Result};
use crate::gate::InitGate;
use crate::sandbox::Sandbox;
use crate::store::{
    get_object, put_object_atomic, KvObject, StoreError, StoreKey, StoreResult,
};

/// Store key prefix shared by all overlay network records.
pub const NETWORK_KEY_PREFIX: [&str; 2] = ["overlay", "network"];

/// One IP pool of a network with its tunnel state.
#[derive(Debug, Clone)]
pub struct Subnet {
    subnet_ip: Ipv4Net,
    gw_ip: Ipv4Net,
    vni: u32,
    vxlan_name: Option<String>,
    bridge_name: Option<String>,
    gate: Arc<InitGate>,
}

impl Subnet {
    /// Creates a subnet with no VNI and no devices.
    #[must_use]
    pub fn new(subnet_ip: Ipv4Net, gw_ip: Ipv4Net) -> Self {
        Self {
            subnet_ip,
            gw_ip,
            vni: 0,
            vxlan_name: None,
            bridge_name: None,
            gate: Arc::new(InitGate::new()),
        }
    }

    /// Pool CIDR.
    #[must_use]
    pub fn subnet_ip(&self) -> Ipv4Net {
        self.subnet_ip
    }

    /// Gateway address with prefix.
    #[must_use]
    pub fn gw_ip(&self) -> Ipv4Net {
        self.gw_ip
    }

    /// VXLAN id, 0 when unassigned.
    #[must_use]
    pub fn vni(&self) -> u32 {
        self.vni
    }

    /// Name of the VXLAN device, once created.
    #[must_use]
    pub fn vxlan_name(&self) -> Option<&str> {
        self.vxlan_name.as_deref()
    }

    /// Name of the bridge, once created.
    #[must_use]
    pub fn bridge_name(&self) -> Option<&str> {
        self.bridge_name.as_deref()
    }

    /// Same pool: equal prefix length and equal address.
    fn matches_pool(&self, pool: &Ipv4Net) -> bool {
        self.subnet_ip.prefix_len() == pool.prefix_len() && self.subnet_ip.addr() == pool.addr()
    }

    /// Pool of the same size containing `ip`'s address.
    fn contains(&self, ip: &Ipv4Net) -> bool {
        self.subnet_ip.prefix_len() == ip.prefix_len() && self.subnet_ip.contains(&ip.addr())
    }
}

/// Serialized form of one subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SubnetRecord {
    #[serde(rename = "subnetIP")]
    subnet_ip: Ipv4Net,
    #[serde(rename = "gwIP")]
    gw_ip: Ipv4Net,
    vni: u32,
}

impl From<&Subnet> for SubnetRecord {
    fn from(s: &Subnet) -> Self {
        Self {
            subnet_ip: s.subnet_ip,
            gw_ip: s.gw_ip,
            vni: s.vni,
        }
    }
}

/// Store record: the first subnet at top level, every subnet in `subnets`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct NetworkRecord {
    #[serde(flatten)]
    primary: SubnetRecord,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    subnets: Vec<SubnetRecord>,
}

impl NetworkRecord {
    fn into_subnets(self) -> Vec<SubnetRecord> {
        if self.subnets.is_empty() {
            vec![self.primary]
        } else {
            self.subnets
        }
    }
}

/// Resources taken out of a network when a sandbox generation ends.
struct Teardown {
    sandbox: Option<Arc<dyn Sandbox>>,
    vxlan_links: Vec<String>,
    // Teardown of the generation before this one.
    previous: Option<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
}

struct NetworkState {
    subnets: Vec<Subnet>,
    sandbox: Option<Arc<dyn Sandbox>>,
    join_count: usize,
    init_epoch: u64,
    sandbox_gate: Arc<InitGate>,
    watcher: Option<CancellationToken>,
    // Flips to true once the latest teardown has released its devices.
    teardown_done: Option<watch::Receiver<bool>>,
    store_index: u64,
    store_exists: bool,
}

impl NetworkState {
    /// Ends the current generation: stops the watcher, takes the sandbox and
    /// device names, and installs fresh gates so the next join rebuilds.
    fn reset_generation(&mut self) -> Teardown {
        if let Some(token) = self.watcher.take() {
            token.cancel();
        }
        self.sandbox_gate = Arc::new(InitGate::new());
        let mut vxlan_links = Vec::new();
        for s in &mut self.subnets {
            s.gate = Arc::new(InitGate::new());
            s.bridge_name = None;
            if let Some(name) = s.vxlan_name.take() {
                vxlan_links.push(name);
            }
        }
        let (done, finished) = watch::channel(false);
        Teardown {
            sandbox: self.sandbox.take(),
            vxlan_links,
            previous: self.teardown_done.replace(finished),
            done,
        }
    }
}

/// An overlay network.
pub struct Network {
    id: String,
    ctx: Arc<OverlayContext>,
    state: Mutex<NetworkState>,
    // Serializes the VNI protocol within this process; peers are fenced by the store.
    vni_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("subnets", &state.subnets)
            .field("join_count", &state.join_count)
            .field("init_epoch", &state.init_epoch)
            .field("store_index", &state.store_index)
            .finish_non_exhaustive()
    }
}

impl Network {
    pub(crate) fn new(id: impl Into<String>, ctx: Arc<OverlayContext>, subnets: Vec<Subnet>) -> Self {
        Self {
            id: id.into(),
            ctx,
            state: Mutex::new(NetworkState {
                subnets,
                sandbox: None,
                join_count: 0,
                init_epoch: 0,
                sandbox_gate: Arc::new(InitGate::new()),
                watcher: None,
                teardown_done: None,
                store_index: 0,
                store_exists: false,
            }),
            vni_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Network identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the network's subnets.
    #[must_use]
    pub fn subnets(&self) -> Vec<Subnet> {
        self.state.lock().subnets.clone()
    }

    /// Number of active joiners.
    #[must_use]
    pub fn join_count(&self) -> usize {
        self.state.lock().join_count
    }

    /// The sandbox of the current generation, if one exists.
    #[must_use]
    pub fn sandbox(&self) -> Option<Arc<dyn Sandbox>> {
        self.state.lock().sandbox.clone()
    }

    /// Number of sandbox initializations so far.
    #[must_use]
    pub fn init_epoch(&self) -> u64 {
        self.state.lock().init_epoch
    }

    /// VNI of the subnet at `idx`.
    pub(crate) fn vxlan_id(&self, idx: usize) -> Result<u32> {
        self.state
            .lock()
            .subnets
            .get(idx)
            .map(|s| s.vni)
            .ok_or_else(|| self.missing_subnet(idx))
    }

    pub(crate) fn set_vxlan_id(&self, idx: usize, vni: u32) {
        if let Some(s) = self.state.lock().subnets.get_mut(idx) {
            s.vni = vni;
        }
    }

    /// Index of the subnet whose pool contains `ip`.
    #[must_use]
    pub fn subnet_for_ip(&self, ip: &Ipv4Net) -> Option<usize> {
        self.state.lock().subnets.iter().position(|s| s.contains(ip))
    }

    /// Index of the subnet with exactly the pool `pool`.
    #[must_use]
    pub fn matching_subnet(&self, pool: &Ipv4Net) -> Option<usize> {
        self.state
            .lock()
            .subnets
            .iter()
            .position(|s| s.matches_pool(pool))
    }

    fn missing_subnet(&self, idx: usize) -> OverlayError {
        OverlayError::InvalidArgument(format!("network {} has no subnet #{idx}", self.id))
    }

    /// Writes the network to the store unless a record already exists.
    ///
    /// A concurrent creator winning the race is not an error: the existing
    /// record is read back instead.
    pub(crate) async fn write_if_absent(&self) -> Result<()> {
        let store = &*self.ctx.store;
        let policy = &self.ctx.config.retry;

        for attempt in 1..=policy.max_attempts {
            match get_object(store, self).await {
                Ok(()) => return Ok(()),
                Err(StoreError::KeyNotFound) => {}
                Err(e) => return Err(OverlayError::store("read network", &self.id, e)),
            }

            match put_object_atomic(store, self).await {
                Ok(()) => return Ok(()),
                Err(StoreError::KeyModified) => {
                    debug!(network = %self.id, attempt, "network record created concurrently, retrying");
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
                Err(e) => return Err(OverlayError::store("create network", &self.id, e)),
            }
        }

        Err(OverlayError::StoreConflict {
            network: self.id.clone(),
            attempts: policy.max_attempts,
        })
    }
}

impl KvObject for Network {
    fn key(&self) -> StoreKey {
        StoreKey::new(NETWORK_KEY_PREFIX.into_iter().chain([self.id.as_str()]))
    }

    fn key_prefix(&self) -> StoreKey {
        StoreKey::new(NETWORK_KEY_PREFIX)
    }

    fn value(&self) -> StoreResult<Vec<u8>> {
        let state = self.state.lock();
        let Some(first) = state.subnets.first() else {
            return Err(StoreError::Codec(format!("network {} has no subnets", self.id)));
        };
        let record = NetworkRecord {
            primary: first.into(),
            subnets: state.subnets.iter().map(SubnetRecord::from).collect(),
        };
        serde_json::to_vec(&record).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn set_value(&self, value: &[u8]) -> StoreResult<()> {
        let record: NetworkRecord =
            serde_json::from_slice(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        let stored = record.into_subnets();

        let mut state = self.state.lock();

        // A shell network being rehydrated takes its subnets from the record;
        // a populated one only learns VNIs assigned elsewhere.
        if state.subnets.is_empty() {
            state.subnets = stored
                .into_iter()
                .map(|r| Subnet {
                    vni: r.vni,
                    ..Subnet::new(r.subnet_ip, r.gw_ip)
                })
                .collect();
            return Ok(());
        }

        for r in stored.into_iter().filter(|r| r.vni != 0) {
            if let Some(s) = state.subnets.iter_mut().find(|s| s.matches_pool(&r.subnet_ip)) {
                s.vni = r.vni;
            }
        }
        Ok(())
    }

    fn index(&self) -> u64 {
        self.state.lock().store_index
    }

    fn set_index(&self, index: u64) {
        let mut state = self.state.lock();
        state.store_index = index;
        state.store_exists = true;
    }

    fn exists(&self) -> bool {
        self.state.lock().store_exists
    }
}
