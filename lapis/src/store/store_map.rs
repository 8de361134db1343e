use crate::errors::LapisResult;
use crate::store::Value;
use std::ops::Deref;
use std::sync::Arc;

/// Low-level interface for a single integer-keyed table in a backing store.
///
/// # Purpose
/// Defines the contract that all key-value store backends must implement for
/// one named table. Consumers drive it through prepared-statement-like
/// operations: point read, keyed write, keyless write with auto-assigned key,
/// and keyed delete.
///
/// # Key Methods
/// - **Basic Operations**: `put()`, `get()`, `remove()`, `contains_key()`
/// - **Key Generation**: `put_auto()` assigns the next ascending key
/// - **Navigation**: `first_key()`, `last_key()`
/// - **Lifecycle**: `clear()`
/// - **State**: `size()`, `is_empty()`, `name()`
///
/// # Thread Safety
/// Implementers must be `Send + Sync` for safe use in concurrent contexts.
/// Serialization of concurrent writers is the caller's responsibility.
pub trait StoreMapProvider: Send + Sync {
    /// Retrieves the value associated with a key.
    fn get(&self, key: i64) -> LapisResult<Option<Value>>;

    /// Inserts or updates a key-value pair. An existing value under the same
    /// key is replaced.
    fn put(&self, key: i64, value: Value) -> LapisResult<()>;

    /// Inserts a value under a freshly assigned key and returns that key.
    ///
    /// Keys are assigned in ascending order; the assigned key is strictly
    /// greater than any key currently in the map.
    fn put_auto(&self, value: Value) -> LapisResult<i64>;

    /// Removes a key-value pair, returning the removed value if the key
    /// existed.
    fn remove(&self, key: i64) -> LapisResult<Option<Value>>;

    /// Checks whether the map contains a key.
    fn contains_key(&self, key: i64) -> LapisResult<bool>;

    /// Returns the number of entries in the map.
    fn size(&self) -> LapisResult<u64>;

    /// Checks if the map is empty.
    fn is_empty(&self) -> LapisResult<bool>;

    /// Returns the first (lowest) key in the map, if any.
    fn first_key(&self) -> LapisResult<Option<i64>>;

    /// Returns the last (highest) key in the map, if any.
    fn last_key(&self) -> LapisResult<Option<i64>>;

    /// Removes all entries from the map.
    fn clear(&self) -> LapisResult<()>;

    /// Returns the name of this map.
    fn name(&self) -> LapisResult<String>;
}

/// A cheaply cloneable handle over a [`StoreMapProvider`] implementation.
#[derive(Clone)]
pub struct StoreMap {
    inner: Arc<dyn StoreMapProvider>,
}

impl Deref for StoreMap {
    type Target = Arc<dyn StoreMapProvider>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::fmt::Debug for StoreMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMap").finish_non_exhaustive()
    }
}

impl StoreMap {
    /// Creates a new `StoreMap` wrapping a provider implementation.
    ///
    /// The provider is wrapped in an `Arc` for efficient, thread-safe
    /// sharing; cloning `StoreMap` only increments the reference count.
    pub fn new<T: StoreMapProvider + 'static>(inner: T) -> Self {
        StoreMap { inner: Arc::new(inner) }
    }
}
