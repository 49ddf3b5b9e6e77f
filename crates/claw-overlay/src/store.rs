//! Key/value store contract with optimistic concurrency.
//!
//! The overlay core never talks to a concrete distributed store. It relies on
//! three operations, each keyed by a hierarchical [`StoreKey`]:
//!
//! - `get` returns the value and the store-assigned index, or
//!   [`StoreError::KeyNotFound`].
//! - `put_if_unchanged` writes only if the record still carries the index the
//!   caller last observed (or does not exist yet when no index is given),
//!   failing with [`StoreError::KeyModified`] otherwise.
//! - `delete_if_unchanged` removes the record under the same rule.
//!
//! Entities that persist themselves implement [`KvObject`]; the
//! [`get_object`], [`put_object_atomic`] and [`delete_object_atomic`] helpers
//! keep their index bookkeeping in sync with the store.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

use crate::BoxFuture;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by a [`KvStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record exists under the key.
    #[error("key not found in store")]
    KeyNotFound,

    /// The record changed since it was last read.
    #[error("key modified in store since last read")]
    KeyModified,

    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A record could not be encoded or decoded.
    #[error("store record codec error: {0}")]
    Codec(String),
}

/// Hierarchical store key, e.g. `overlay/network/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(Vec<String>);

impl StoreKey {
    /// Builds a key from its path components.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Path components of the key.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Returns true if `prefix` is a leading sub-path of this key.
    #[must_use]
    pub fn starts_with(&self, prefix: &StoreKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// A stored value with the index the store assigned to its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Raw record bytes.
    pub value: Vec<u8>,
    /// Opaque, increasing modification index.
    pub index: u64,
}

/// Visibility of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataScope {
    /// Visible only to this host.
    Local,
    /// Shared across the cluster.
    Global,
}

/// Key/value store supporting compare-and-swap writes.
pub trait KvStore: Send + Sync {
    /// Reads the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] if no record exists.
    fn get<'a>(&'a self, key: &'a StoreKey) -> BoxFuture<'a, StoreResult<KvPair>>;

    /// Writes `value` if the record still has index `previous`.
    ///
    /// `None` means the caller believes the record does not exist yet.
    /// Returns the index assigned to the write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyModified`] if the record changed (or was
    /// created concurrently), [`StoreError::KeyNotFound`] if the caller
    /// expected a record that is gone.
    fn put_if_unchanged<'a>(
        &'a self,
        key: &'a StoreKey,
        value: Vec<u8>,
        previous: Option<u64>,
    ) -> BoxFuture<'a, StoreResult<u64>>;

    /// Deletes the record if it still has index `index`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyModified`] or [`StoreError::KeyNotFound`] when
    /// another writer got there first.
    fn delete_if_unchanged<'a>(
        &'a self,
        key: &'a StoreKey,
        index: u64,
    ) -> BoxFuture<'a, StoreResult<()>>;
}

/// An entity that persists itself as a single store record.
///
/// Methods take `&self`; implementors keep their state behind their own lock.
pub trait KvObject: Send + Sync {
    /// Full key of the record.
    fn key(&self) -> StoreKey;

    /// Key shared by all records of this kind.
    fn key_prefix(&self) -> StoreKey;

    /// Serializes the object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] if the object has nothing to persist.
    fn value(&self) -> StoreResult<Vec<u8>>;

    /// Merges a stored record into the object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] if the record is malformed.
    fn set_value(&self, value: &[u8]) -> StoreResult<()>;

    /// Index of the last observed write.
    fn index(&self) -> u64;

    /// Records the index of an observed write; the object now exists.
    fn set_index(&self, index: u64);

    /// Whether the object has ever been observed in the store.
    fn exists(&self) -> bool;

    /// Objects that should never be persisted return true.
    fn skip(&self) -> bool {
        false
    }

    /// Scope of the record.
    fn data_scope(&self) -> DataScope {
        DataScope::Global
    }
}

/// Loads `obj` from the store, merging the value and adopting its index.
///
/// # Errors
///
/// Propagates store and codec errors.
pub async fn get_object(store: &dyn KvStore, obj: &dyn KvObject) -> StoreResult<()> {
    let pair = store.get(&obj.key()).await?;
    obj.set_value(&pair.value)?;
    obj.set_index(pair.index);
    Ok(())
}

/// Writes `obj` if the stored record is unchanged since it was last observed.
///
/// # Errors
///
/// Returns [`StoreError::KeyModified`] on a lost race.
pub async fn put_object_atomic(store: &dyn KvStore, obj: &dyn KvObject) -> StoreResult<()> {
    if obj.skip() {
        return Ok(());
    }
    let value = obj.value()?;
    let previous = obj.exists().then(|| obj.index());
    let index = store.put_if_unchanged(&obj.key(), value, previous).await?;
    obj.set_index(index);
    Ok(())
}

/// Deletes `obj` if the stored record is unchanged since it was last observed.
///
/// # Errors
///
/// Returns [`StoreError::KeyModified`] or [`StoreError::KeyNotFound`] when
/// another writer changed or removed the record.
pub async fn delete_object_atomic(store: &dyn KvStore, obj: &dyn KvObject) -> StoreResult<()> {
    if obj.skip() {
        return Ok(());
    }
    store.delete_if_unchanged(&obj.key(), obj.index()).await
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    entries: HashMap<StoreKey, KvPair>,
    last_index: u64,
}

/// In-process [`KvStore`] with the same compare-and-swap semantics as a
/// distributed backend.
///
/// Share one instance (behind an `Arc`) between several drivers to model
/// cooperating processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record under `key` without going through the async API.
    #[must_use]
    pub fn snapshot(&self, key: &StoreKey) -> Option<KvPair> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Lists every key under `prefix`.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &StoreKey) -> Vec<StoreKey> {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    fn put_sync(&self, key: &StoreKey, value: Vec<u8>, previous: Option<u64>) -> StoreResult<u64> {
        let mut state = self.state.lock();
        match (state.entries.get(key), previous) {
            (Some(_), None) => return Err(StoreError::KeyModified),
            (None, Some(_)) => return Err(StoreError::KeyNotFound),
            (Some(current), Some(prev)) if current.index != prev => {
                return Err(StoreError::KeyModified);
            }
            _ => {}
        }
        state.last_index += 1;
        let index = state.last_index;
        state.entries.insert(key.clone(), KvPair { value, index });
        Ok(index)
    }

    fn delete_sync(&self, key: &StoreKey, index: u64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let current = state.entries.get(key).ok_or(StoreError::KeyNotFound)?;
        if current.index != index {
            return Err(StoreError::KeyModified);
        }
        state.entries.remove(key);
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a StoreKey) -> BoxFuture<'a, StoreResult<KvPair>> {
        Box::pin(async move { self.snapshot(key).ok_or(StoreError::KeyNotFound) })
    }

    fn put_if_unchanged<'a>(
        &'a self,
        key: &'a StoreKey,
        value: Vec<u8>,
        previous: Option<u64>,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move { self.put_sync(key, value, previous) })
    }

    fn delete_if_unchanged<'a>(
        &'a self,
        key: &'a StoreKey,
        index: u64,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { self.delete_sync(key, index) })
    }
}
