use crate::errors::LapisResult;
use crate::store::StoreMap;
use std::ops::Deref;
use std::sync::Arc;

/// Interface for backing-store implementations.
///
/// # Purpose
/// A store is a collection of named integer-keyed maps plus the physical
/// parameters index modules need when sizing their on-disk structures
/// (notably the page size). Index modules open one map per logical table
/// and otherwise stay ignorant of how the store persists data.
///
/// # Thread Safety
/// Implementers must be `Send + Sync`. The store serializes its own registry
/// operations; serialization of concurrent writers to the map contents is
/// the caller's responsibility.
pub trait StoreProvider: Send + Sync {
    /// Opens the named map, creating it if it does not exist.
    fn open_map(&self, name: &str) -> LapisResult<StoreMap>;

    /// Checks whether a map with the given name exists.
    fn has_map(&self, name: &str) -> LapisResult<bool>;

    /// Renames a map. Fails when the source does not exist or the target
    /// name is already taken.
    fn rename_map(&self, old_name: &str, new_name: &str) -> LapisResult<()>;

    /// Removes a map and all its contents.
    fn remove_map(&self, name: &str) -> LapisResult<()>;

    /// The page size of the underlying pager, in bytes. Index modules derive
    /// their node sizes from this so one node fits one page.
    fn page_size(&self) -> usize;

    /// Checks if the store is closed.
    fn is_closed(&self) -> LapisResult<bool>;

    /// Closes the store. Further operations fail with
    /// `ErrorKind::StoreAlreadyClosed`.
    fn close(&self) -> LapisResult<()>;
}

/// A cheaply cloneable handle over a [`StoreProvider`] implementation.
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn StoreProvider>,
}

impl Deref for Store {
    type Target = Arc<dyn StoreProvider>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Store {
    /// Creates a new `Store` wrapping a provider implementation.
    pub fn new<T: StoreProvider + 'static>(inner: T) -> Self {
        Store { inner: Arc::new(inner) }
    }
}
