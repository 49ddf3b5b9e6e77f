//! VXLAN id allocation against the shared store.
//!
//! A subnet's VNI is drawn from the cluster allocator and only counts once it
//! has been written to the network's store record. Losing a write race
//! returns the draw to the allocator and retries with the winner's record.

use tracing::{debug, info};

use super::Network;
use crate::error::{OverlayError, Result};
use crate::store::{delete_object_atomic, get_object, put_object_atomic, StoreError};

impl Network {
    /// Ensures the subnet at `idx` has a VNI persisted in the store.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if the record disappeared,
    /// [`OverlayError::Allocator`] if no id can be drawn,
    /// [`OverlayError::StoreConflict`] when retries run out, and
    /// [`OverlayError::Store`] for any other store failure.
    pub(crate) async fn obtain_vxlan_id(&self, idx: usize) -> Result<u32> {
        let current = self.vxlan_id(idx)?;
        if current != 0 {
            return Ok(current);
        }

        let _serialized = self.vni_lock.lock().await;
        let store = &*self.ctx.store;
        let policy = &self.ctx.config.retry;

        for attempt in 1..=policy.max_attempts {
            match get_object(store, self).await {
                Ok(()) => {}
                Err(StoreError::KeyNotFound) => {
                    return Err(OverlayError::NotFound(self.id.clone()));
                }
                Err(e) => return Err(OverlayError::store("read network", &self.id, e)),
            }

            let stored = self.vxlan_id(idx)?;
            if stored != 0 {
                return Ok(stored);
            }

            let vni = self
                .ctx
                .vxlan_idm
                .allocate()
                .await
                .map_err(|source| OverlayError::Allocator {
                    network: self.id.clone(),
                    source,
                })?;
            self.set_vxlan_id(idx, vni);

            match put_object_atomic(store, self).await {
                Ok(()) => {
                    info!(network = %self.id, subnet = idx, vni, "vxlan id assigned");
                    return Ok(vni);
                }
                Err(e) => {
                    self.ctx.vxlan_idm.release(vni).await;
                    self.set_vxlan_id(idx, 0);
                    if e != StoreError::KeyModified {
                        return Err(OverlayError::store("update network", &self.id, e));
                    }
                    debug!(network = %self.id, vni, attempt, "lost vxlan id race, retrying");
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }

        Err(OverlayError::StoreConflict {
            network: self.id.clone(),
            attempts: policy.max_attempts,
        })
    }

    /// Deletes the store record and hands every subnet VNI back to the allocator.
    ///
    /// When another actor changed or removed the record first, nothing is
    /// released: the ids belong to whoever holds the record now.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Store`] if the delete fails for any other reason.
    pub(crate) async fn release_vxlan_id(&self) -> Result<()> {
        if self.state.lock().subnets.is_empty() {
            return Ok(());
        }

        let _serialized = self.vni_lock.lock().await;

        match delete_object_atomic(&*self.ctx.store, self).await {
            Ok(()) => {}
            Err(e @ (StoreError::KeyModified | StoreError::KeyNotFound)) => {
                debug!(network = %self.id, error = %e, "network record owned elsewhere, keeping vxlan ids");
                return Ok(());
            }
            Err(e) => return Err(OverlayError::store("delete network", &self.id, e)),
        }

        let released: Vec<u32> = {
            let mut state = self.state.lock();
            state.store_exists = false;
            state
                .subnets
                .iter_mut()
                .filter(|s| s.vni != 0)
                .map(|s| std::mem::take(&mut s.vni))
                .collect()
        };
        for vni in released {
            self.ctx.vxlan_idm.release(vni).await;
            debug!(network = %self.id, vni, "vxlan id released");
        }
        Ok(())
    }
}
