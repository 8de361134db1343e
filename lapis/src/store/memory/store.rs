use crate::errors::{ErrorKind, LapisError, LapisResult};
use crate::store::memory::config::InMemoryStoreConfig;
use crate::store::memory::map::InMemoryMap;
use crate::store::{StoreMap, StoreProvider};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory implementation of a Lapis backing store.
///
/// # Purpose
/// `InMemoryStore` provides a complete in-memory store implementation
/// suitable for testing, temporary data, and scenarios where persistence is
/// not required. All data is stored in memory using concurrent data
/// structures for thread-safe access.
///
/// # Characteristics
/// - **Thread-Safe**: Fully concurrent with safe data sharing across threads
/// - **Registry Management**: Tracks named maps, supports rename and removal
/// - **Temporary Storage**: All data is lost when the store is dropped
///
/// # Usage
/// ```text
/// let store = Store::new(InMemoryStore::new(InMemoryStoreConfig::new()));
/// let map = store.open_map("demo_node")?;
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<InMemoryStoreInner>,
}

impl InMemoryStore {
    /// Creates a new in-memory store with the specified configuration.
    pub fn new(config: InMemoryStoreConfig) -> InMemoryStore {
        InMemoryStore {
            inner: Arc::new(InMemoryStoreInner {
                maps: DashMap::new(),
                registry_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore::new(InMemoryStoreConfig::new())
    }
}

struct InMemoryStoreInner {
    maps: DashMap<String, InMemoryMap>,
    // Serializes rename/remove so registry updates stay consistent.
    registry_lock: Mutex<()>,
    closed: AtomicBool,
    config: InMemoryStoreConfig,
}

impl InMemoryStoreInner {
    fn check_opened(&self) -> LapisResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(LapisError::new(
                "Store is closed",
                ErrorKind::StoreAlreadyClosed,
            ));
        }
        Ok(())
    }
}

impl StoreProvider for InMemoryStore {
    fn open_map(&self, name: &str) -> LapisResult<StoreMap> {
        self.inner.check_opened()?;
        let map = self
            .inner
            .maps
            .entry(name.to_string())
            .or_insert_with(|| InMemoryMap::new(name))
            .clone();
        Ok(StoreMap::new(map))
    }

    fn has_map(&self, name: &str) -> LapisResult<bool> {
        self.inner.check_opened()?;
        Ok(self.inner.maps.contains_key(name))
    }

    fn rename_map(&self, old_name: &str, new_name: &str) -> LapisResult<()> {
        self.inner.check_opened()?;
        let _guard = self.inner.registry_lock.lock();
        if self.inner.maps.contains_key(new_name) {
            return Err(LapisError::new(
                &format!("Map {} already exists", new_name),
                ErrorKind::InvalidOperation,
            ));
        }
        let (_, map) = self.inner.maps.remove(old_name).ok_or_else(|| {
            LapisError::new(&format!("Map {} not found", old_name), ErrorKind::NotFound)
        })?;
        map.set_name(new_name);
        self.inner.maps.insert(new_name.to_string(), map);
        Ok(())
    }

    fn remove_map(&self, name: &str) -> LapisResult<()> {
        self.inner.check_opened()?;
        let _guard = self.inner.registry_lock.lock();
        if let Some((_, map)) = self.inner.maps.remove(name) {
            map.mark_dropped();
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.inner.config.page_size()
    }

    fn is_closed(&self) -> LapisResult<bool> {
        Ok(self.inner.closed.load(Ordering::Relaxed))
    }

    fn close(&self) -> LapisResult<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}
