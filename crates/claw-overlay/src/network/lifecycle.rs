//! Sandbox lifecycle: join, leave and teardown.
//!
//! A network's sandbox is built lazily by the first joiner and torn down by
//! the last leaver. Construction of the sandbox and of each subnet's devices
//! goes through an [`InitGate`], so racing joiners wait for one builder and
//! share its outcome. Teardown installs fresh gates, which starts a new
//! generation; joiners that straddled a teardown notice the swap and retry.

use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Network, Teardown};
use crate::error::{OverlayError, Result};
use crate::gate::InitGate;
use crate::sandbox::{generate_iface_name, InterfaceKind, InterfaceOptions, Sandbox};
use crate::watcher::NeighborMissWatcher;

impl Network {
    /// Joins the network through its first subnet.
    ///
    /// # Errors
    ///
    /// See [`Network::join_endpoint`].
    pub async fn join(&self) -> Result<()> {
        self.join_endpoint(None).await
    }

    /// Joins the network through the subnet containing `address`, or the
    /// first subnet when no address is given.
    ///
    /// On success the join count grows by exactly one.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidArgument`] if no subnet matches, and the
    /// sandbox, device or VNI allocation failure otherwise. A failed
    /// construction is shared by every caller that raced on it.
    pub async fn join_endpoint(&self, address: Option<Ipv4Net>) -> Result<()> {
        let idx = self.select_subnet(address.as_ref())?;

        loop {
            let sandbox_gate = Arc::clone(&self.state.lock().sandbox_gate);

            if let Err(e) = sandbox_gate.run(|| self.init_sandbox(&sandbox_gate)).await {
                self.reset_failed_generation(&sandbox_gate).await;
                return Err(e);
            }

            if let Err(e) = self.obtain_vxlan_id(idx).await {
                self.reset_failed_generation(&sandbox_gate).await;
                return Err(e);
            }

            let Some((subnet_gate, sandbox)) = self.current_subnet_gate(&sandbox_gate, idx) else {
                debug!(network = %self.id, "sandbox generation ended during join, retrying");
                continue;
            };

            if let Err(e) = subnet_gate
                .run(|| self.init_subnet_sandbox(idx, &subnet_gate, sandbox))
                .await
            {
                self.reset_failed_generation(&sandbox_gate).await;
                return Err(e);
            }

            {
                let mut state = self.state.lock();
                let current = Arc::ptr_eq(&state.sandbox_gate, &sandbox_gate)
                    && state
                        .subnets
                        .get(idx)
                        .is_some_and(|s| Arc::ptr_eq(&s.gate, &subnet_gate));
                if current {
                    state.join_count += 1;
                    debug!(network = %self.id, join_count = state.join_count, "joined network");
                    return Ok(());
                }
            }

            debug!(network = %self.id, "sandbox generation ended during join, retrying");
        }
    }

    /// Releases one join. The last leaver tears the sandbox down.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidArgument`] if nobody has joined.
    pub async fn leave(&self) -> Result<()> {
        let teardown = {
            let mut state = self.state.lock();
            if state.join_count == 0 {
                return Err(OverlayError::InvalidArgument(format!(
                    "leave on network {} without a matching join",
                    self.id
                )));
            }
            state.join_count -= 1;
            if state.join_count > 0 {
                debug!(network = %self.id, join_count = state.join_count, "left network");
                return Ok(());
            }
            state.reset_generation()
        };

        self.destroy_sandbox(teardown).await;
        info!(network = %self.id, "last joiner left, sandbox destroyed");
        Ok(())
    }

    /// Tears the sandbox down regardless of active joiners.
    pub(crate) async fn shutdown(&self) {
        let teardown = {
            let mut state = self.state.lock();
            if state.join_count > 0 {
                warn!(network = %self.id, join_count = state.join_count, "tearing down network with active joiners");
            }
            state.join_count = 0;
            state.reset_generation()
        };
        self.destroy_sandbox(teardown).await;
    }

    fn select_subnet(&self, address: Option<&Ipv4Net>) -> Result<usize> {
        match address {
            Some(ip) => self.subnet_for_ip(ip).ok_or_else(|| {
                OverlayError::InvalidArgument(format!(
                    "no subnet of network {} contains {ip}",
                    self.id
                ))
            }),
            None if self.state.lock().subnets.is_empty() => Err(OverlayError::InvalidArgument(
                format!("network {} has no subnets", self.id),
            )),
            None => Ok(0),
        }
    }

    /// Subnet gate and sandbox of the generation opened by `sandbox_gate`, if
    /// that generation is still current.
    fn current_subnet_gate(
        &self,
        sandbox_gate: &Arc<InitGate>,
        idx: usize,
    ) -> Option<(Arc<InitGate>, Arc<dyn Sandbox>)> {
        let state = self.state.lock();
        if !Arc::ptr_eq(&state.sandbox_gate, sandbox_gate) {
            return None;
        }
        let sandbox = state.sandbox.clone()?;
        let gate = Arc::clone(&state.subnets.get(idx)?.gate);
        Some((gate, sandbox))
    }

    async fn init_sandbox(&self, gate: &Arc<InitGate>) -> Result<()> {
        // Devices of the previous generation must be gone before new ones
        // reuse the same VNIs.
        let pending = self.state.lock().teardown_done.clone();
        if let Some(mut finished) = pending {
            let _ = finished.wait_for(|done| *done).await;
        }

        let epoch = {
            let mut state = self.state.lock();
            state.init_epoch += 1;
            state.init_epoch
        };
        let key = self.ctx.sandboxes.generate_key(&format!("{epoch}-{}", self.id));

        let sandbox = self
            .ctx
            .sandboxes
            .create(&key, true)
            .await
            .map_err(|e| e.context(format!("could not create sandbox for network {}", self.id)))?;

        let cancel = CancellationToken::new();
        let installed = {
            let mut state = self.state.lock();
            let current = Arc::ptr_eq(&state.sandbox_gate, gate);
            if current {
                state.sandbox = Some(Arc::clone(&sandbox));
                state.watcher = Some(cancel.clone());
            }
            current
        };
        if !installed {
            debug!(network = %self.id, sandbox = %key, "network torn down while building sandbox");
            if let Err(e) = sandbox.destroy().await {
                warn!(network = %self.id, sandbox = %key, error = %e, "failed to destroy orphaned sandbox");
            }
            return Ok(());
        }

        if let Err(e) = self.ctx.peers.update_sandbox(&self.id).await {
            warn!(network = %self.id, error = %e, "failed to replay peers into sandbox");
        }

        match sandbox.subscribe_neighbors().await {
            Ok(subscription) => {
                NeighborMissWatcher::new(
                    self.id.clone(),
                    Arc::clone(&self.ctx.resolver),
                    Arc::clone(&self.ctx.peers),
                    self.ctx.config.watcher_error_backoff(),
                )
                .spawn(subscription, cancel);
            }
            Err(e) => {
                warn!(network = %self.id, sandbox = %key, error = %e, "neighbor misses will not be resolved");
            }
        }

        info!(network = %self.id, sandbox = %key, epoch, "sandbox initialized");
        Ok(())
    }

    async fn init_subnet_sandbox(
        &self,
        idx: usize,
        gate: &Arc<InitGate>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<()> {
        let (subnet_ip, gw_ip, vni) = {
            let state = self.state.lock();
            let s = state.subnets.get(idx).ok_or_else(|| self.missing_subnet(idx))?;
            (s.subnet_ip, s.gw_ip, s.vni)
        };
        if vni == 0 {
            return Err(OverlayError::InvalidArgument(format!(
                "subnet {subnet_ip} of network {} has no vxlan id",
                self.id
            )));
        }

        let config = &self.ctx.config;
        let bridge = generate_iface_name(&config.bridge_prefix, config.bridge_suffix_len);
        sandbox
            .add_interface(
                &bridge,
                InterfaceKind::Bridge,
                InterfaceOptions::new().address(gw_ip).bridge(true),
            )
            .await
            .map_err(|e| e.context(format!("bridge creation in sandbox failed for subnet {subnet_ip}")))?;

        let vxlan = match self.ctx.links.create_vxlan(vni).await {
            Ok(name) => name,
            Err(e) => {
                self.remove_orphan_bridge(&*sandbox, &bridge).await;
                return Err(e.context(format!("vxlan interface creation failed for subnet {subnet_ip}")));
            }
        };

        if let Err(e) = sandbox
            .add_interface(
                &vxlan,
                InterfaceKind::Vxlan,
                InterfaceOptions::new().master(bridge.as_str()),
            )
            .await
        {
            if let Err(de) = self.ctx.links.delete_vxlan(&vxlan).await {
                warn!(network = %self.id, vxlan = %vxlan, error = %de, "failed to delete vxlan device");
            }
            self.remove_orphan_bridge(&*sandbox, &bridge).await;
            return Err(e.context(format!("vxlan interface creation failed for subnet {subnet_ip}")));
        }

        let recorded = {
            let mut state = self.state.lock();
            match state.subnets.get_mut(idx) {
                Some(s) if Arc::ptr_eq(&s.gate, gate) => {
                    s.bridge_name = Some(bridge.clone());
                    s.vxlan_name = Some(vxlan.clone());
                    true
                }
                _ => false,
            }
        };
        if !recorded {
            debug!(network = %self.id, vxlan = %vxlan, "network torn down while building subnet devices");
            if let Err(e) = self.ctx.links.delete_vxlan(&vxlan).await {
                warn!(network = %self.id, vxlan = %vxlan, error = %e, "failed to delete vxlan device");
            }
            return Ok(());
        }

        info!(network = %self.id, subnet = %subnet_ip, vni, bridge = %bridge, vxlan = %vxlan, "subnet devices created");
        Ok(())
    }

    async fn remove_orphan_bridge(&self, sandbox: &dyn Sandbox, bridge: &str) {
        if let Err(e) = sandbox.remove_interface(bridge).await {
            warn!(network = %self.id, bridge, error = %e, "failed to remove bridge");
        }
    }

    /// Ends a generation whose construction failed, if no one joined it and no
    /// one has reset it already.
    async fn reset_failed_generation(&self, gate: &Arc<InitGate>) {
        let teardown = {
            let mut state = self.state.lock();
            if state.join_count != 0 || !Arc::ptr_eq(&state.sandbox_gate, gate) {
                return;
            }
            state.reset_generation()
        };
        debug!(network = %self.id, "resetting failed sandbox generation");
        self.destroy_sandbox(teardown).await;
    }

    async fn destroy_sandbox(&self, teardown: Teardown) {
        let Teardown {
            sandbox,
            vxlan_links,
            previous,
            done,
        } = teardown;

        if let Some(mut finished) = previous {
            let _ = finished.wait_for(|done| *done).await;
        }

        if let Some(sandbox) = &sandbox {
            for iface in sandbox.interfaces().into_iter().rev() {
                if let Err(e) = sandbox.remove_interface(&iface.name).await {
                    warn!(network = %self.id, interface = %iface.name, error = %e, "failed to remove interface");
                }
            }
        }

        for link in &vxlan_links {
            if let Err(e) = self.ctx.links.delete_vxlan(link).await {
                warn!(network = %self.id, vxlan = %link, error = %e, "failed to delete vxlan device");
            }
        }

        if let Some(sandbox) = sandbox {
            if let Err(e) = sandbox.destroy().await {
                warn!(network = %self.id, sandbox = %sandbox.key(), error = %e, "failed to destroy sandbox");
            }
        }

        done.send_replace(true);
    }
}
