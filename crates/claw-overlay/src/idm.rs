//! VXLAN Network Identifier allocation.
//!
//! The overlay core asks an [`IdAllocator`] for cluster-wide unique VNIs and
//! hands them back when a network is deleted. [`VniPool`] is the in-process
//! implementation used by single-host deployments and tests.
//!
//! # VNI range
//!
//! ```text
//! 0                 - reserved, "no VNI assigned"
//! 1 ..= 16_777_215  - usable (24-bit field in the VXLAN header)
//! ```

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::BoxFuture;

/// Smallest assignable VNI.
pub const VNI_MIN: u32 = 1;

/// Largest assignable VNI (24 bits).
pub const VNI_MAX: u32 = (1 << 24) - 1;

/// Errors that can occur during VNI allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// Every id in the range is in use.
    #[error("no vxlan ids available in range {start}-{end}")]
    Exhausted {
        /// First id of the range.
        start: u32,
        /// Last id of the range.
        end: u32,
    },
    /// The configured range is unusable.
    #[error("invalid vxlan id range {start}-{end}")]
    InvalidRange {
        /// First id of the range.
        start: u32,
        /// Last id of the range.
        end: u32,
    },
    /// The allocator backend failed.
    #[error("id allocator backend error: {0}")]
    Backend(String),
}

/// Cluster-wide unique id allocator.
pub trait IdAllocator: Send + Sync {
    /// Draws an unused id.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Exhausted`] when the range is used up.
    fn allocate(&self) -> BoxFuture<'_, Result<u32, AllocatorError>>;

    /// Returns an id to the pool. Releasing an id that is not held is a no-op.
    fn release(&self, id: u32) -> BoxFuture<'_, ()>;
}

#[derive(Debug)]
struct PoolState {
    allocated: HashSet<u32>,
    next_candidate: u32,
    draws: u64,
    releases: u64,
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Ids currently held.
    pub allocated: usize,
    /// Ids still free.
    pub available: usize,
    /// Successful draws since creation.
    pub draws: u64,
    /// Successful releases since creation.
    pub releases: u64,
}

/// In-process VNI pool over an inclusive range.
///
/// Draws walk a cursor through the range and wrap around, so a released id is
/// not handed out again until the rest of the range has been tried.
#[derive(Debug)]
pub struct VniPool {
    start: u32,
    end: u32,
    state: Mutex<PoolState>,
}

impl VniPool {
    /// Creates a pool over `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is empty or leaves the 24-bit VNI space.
    pub fn new(start: u32, end: u32) -> Result<Self, AllocatorError> {
        if start < VNI_MIN || end > VNI_MAX || start > end {
            return Err(AllocatorError::InvalidRange { start, end });
        }
        Ok(Self {
            start,
            end,
            state: Mutex::new(PoolState {
                allocated: HashSet::new(),
                next_candidate: start,
                draws: 0,
                releases: 0,
            }),
        })
    }

    /// Creates a pool over the whole 24-bit range.
    #[must_use]
    pub fn full_range() -> Self {
        Self {
            start: VNI_MIN,
            end: VNI_MAX,
            state: Mutex::new(PoolState {
                allocated: HashSet::new(),
                next_candidate: VNI_MIN,
                draws: 0,
                releases: 0,
            }),
        }
    }

    /// Draws the next free id.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Exhausted`] if every id is held.
    pub fn allocate_id(&self) -> Result<u32, AllocatorError> {
        let mut state = self.state.lock();

        // Try from the cursor to the end, then wrap around to the start.
        let found = (state.next_candidate..=self.end)
            .chain(self.start..state.next_candidate)
            .find(|id| !state.allocated.contains(id));

        let Some(id) = found else {
            return Err(AllocatorError::Exhausted {
                start: self.start,
                end: self.end,
            });
        };

        state.allocated.insert(id);
        state.draws += 1;
        state.next_candidate = if id == self.end { self.start } else { id + 1 };
        debug!(vni = id, "allocated vxlan id");
        Ok(id)
    }

    /// Returns `id` to the pool. Returns false if it was not held.
    pub fn release_id(&self, id: u32) -> bool {
        let mut state = self.state.lock();
        if state.allocated.remove(&id) {
            state.releases += 1;
            debug!(vni = id, "released vxlan id");
            true
        } else {
            warn!(vni = id, "release of vxlan id that is not allocated");
            false
        }
    }

    /// Checks if an id is currently held.
    #[must_use]
    pub fn is_allocated(&self, id: u32) -> bool {
        self.state.lock().allocated.contains(&id)
    }

    /// Returns usage counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let total = (self.end - self.start) as usize + 1;
        PoolStats {
            allocated: state.allocated.len(),
            available: total.saturating_sub(state.allocated.len()),
            draws: state.draws,
            releases: state.releases,
        }
    }
}

impl Default for VniPool {
    fn default() -> Self {
        Self::full_range()
    }
}

impl IdAllocator for VniPool {
    fn allocate(&self) -> BoxFuture<'_, Result<u32, AllocatorError>> {
        Box::pin(async move { self.allocate_id() })
    }

    fn release(&self, id: u32) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.release_id(id);
        })
    }
}
