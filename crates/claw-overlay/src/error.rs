//! Error types for overlay network operations.

use thiserror::Error;

use crate::idm::AllocatorError;
use crate::store::StoreError;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Errors that can occur while managing overlay networks.
///
/// Errors are `Clone` because a failed sandbox or device initialization is
/// memoized and handed to every caller that raced on the same init gate.
#[derive(Debug, Clone, Error)]
pub enum OverlayError {
    /// A caller supplied an unusable argument (empty network id, unbalanced leave).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The network is not registered or has no store record.
    #[error("network not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency retries ran out under sustained contention.
    #[error("store conflict on network {network}: gave up after {attempts} attempts")]
    StoreConflict {
        /// Network whose record kept changing.
        network: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Non-retryable store failure.
    #[error("{op} for network {network} failed: {source}")]
    Store {
        /// Operation that failed.
        op: &'static str,
        /// Network the operation was acting on.
        network: String,
        /// Underlying store error.
        source: StoreError,
    },

    /// The VNI allocator could not hand out an id.
    #[error("failed to allocate vxlan id for network {network}: {source}")]
    Allocator {
        /// Network that asked for an id.
        network: String,
        /// Underlying allocator error.
        source: AllocatorError,
    },

    /// Namespace or device construction failed.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// A peer could not be resolved or programmed.
    #[error("peer resolution failed: {0}")]
    Resolution(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl OverlayError {
    /// Wraps a store error with the operation and network it belongs to.
    pub fn store(op: &'static str, network: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            op,
            network: network.into(),
            source,
        }
    }

    /// Prefixes sandbox and resolution messages with what was being attempted.
    ///
    /// Other variants already carry their own context and pass through.
    #[must_use]
    pub fn context(self, what: impl std::fmt::Display) -> Self {
        match self {
            Self::Sandbox(msg) => Self::Sandbox(format!("{what}: {msg}")),
            Self::Resolution(msg) => Self::Resolution(format!("{what}: {msg}")),
            other => other,
        }
    }

    /// Returns true if the allocator ran out of ids.
    #[must_use]
    pub fn is_allocator_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Allocator {
                source: AllocatorError::Exhausted { .. },
                ..
            }
        )
    }
}
