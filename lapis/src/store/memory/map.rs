use crate::errors::{ErrorKind, LapisError, LapisResult};
use crate::store::{StoreMapProvider, Value};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory key-value map implementation using a concurrent skip list.
///
/// # Purpose
/// `InMemoryMap` provides fast, thread-safe access to integer-keyed values
/// stored entirely in memory. It uses a concurrent skip list internally for
/// O(log n) operations and keeps keys ordered so auto-assigned keys stay
/// ascending.
///
/// # Characteristics
/// - **Thread-Safe**: Can be safely cloned and shared across threads
/// - **Ordered Keys**: Supports first/last key navigation
/// - **Key Generation**: `put_auto` assigns max-key + 1 under a lock
/// - **Lifecycle Management**: Dropped maps reject further operations
#[derive(Clone)]
pub struct InMemoryMap {
    inner: Arc<InMemoryMapInner>,
}

impl InMemoryMap {
    /// Creates a new in-memory map with the given name.
    pub(crate) fn new(name: &str) -> Self {
        InMemoryMap {
            inner: Arc::new(InMemoryMapInner::new(name)),
        }
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.inner.name.write() = name.to_string();
    }

    pub(crate) fn mark_dropped(&self) {
        self.inner.dropped.store(true, Ordering::Relaxed);
    }
}

impl StoreMapProvider for InMemoryMap {
    fn get(&self, key: i64) -> LapisResult<Option<Value>> {
        self.inner.check_valid()?;
        Ok(self.inner.backing_map.get(&key).map(|e| e.value().clone()))
    }

    fn put(&self, key: i64, value: Value) -> LapisResult<()> {
        self.inner.check_valid()?;
        self.inner.backing_map.insert(key, value);
        Ok(())
    }

    fn put_auto(&self, value: Value) -> LapisResult<i64> {
        self.inner.check_valid()?;
        // The lock keeps concurrent auto-inserts from computing the same key.
        let _guard = self.inner.auto_key_lock.lock();
        let key = self
            .inner
            .backing_map
            .back()
            .map(|e| *e.key() + 1)
            .unwrap_or(1);
        self.inner.backing_map.insert(key, value);
        Ok(key)
    }

    fn remove(&self, key: i64) -> LapisResult<Option<Value>> {
        self.inner.check_valid()?;
        Ok(self.inner.backing_map.remove(&key).map(|e| e.value().clone()))
    }

    fn contains_key(&self, key: i64) -> LapisResult<bool> {
        self.inner.check_valid()?;
        Ok(self.inner.backing_map.contains_key(&key))
    }

    fn size(&self) -> LapisResult<u64> {
        self.inner.check_valid()?;
        Ok(self.inner.backing_map.len() as u64)
    }

    fn is_empty(&self) -> LapisResult<bool> {
        self.inner.check_valid()?;
        Ok(self.inner.backing_map.is_empty())
    }

    fn first_key(&self) -> LapisResult<Option<i64>> {
        self.inner.check_valid()?;
        Ok(self.inner.backing_map.front().map(|e| *e.key()))
    }

    fn last_key(&self) -> LapisResult<Option<i64>> {
        self.inner.check_valid()?;
        Ok(self.inner.backing_map.back().map(|e| *e.key()))
    }

    fn clear(&self) -> LapisResult<()> {
        self.inner.check_valid()?;
        while self.inner.backing_map.pop_front().is_some() {}
        Ok(())
    }

    fn name(&self) -> LapisResult<String> {
        Ok(self.inner.name.read().clone())
    }
}

struct InMemoryMapInner {
    backing_map: SkipMap<i64, Value>,
    auto_key_lock: Mutex<()>,
    dropped: AtomicBool,
    name: RwLock<String>,
}

impl InMemoryMapInner {
    fn new(name: &str) -> InMemoryMapInner {
        InMemoryMapInner {
            backing_map: SkipMap::new(),
            auto_key_lock: Mutex::new(()),
            dropped: AtomicBool::new(false),
            name: RwLock::new(name.to_string()),
        }
    }

    fn check_valid(&self) -> LapisResult<()> {
        if self.dropped.load(Ordering::Relaxed) {
            let name = self.name.read().clone();
            log::error!("Map {} is dropped", name);
            return Err(LapisError::new(
                &format!("Map {} is dropped", name),
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_put_get_remove() {
        let map = InMemoryMap::new("t");
        map.put(1, Value::Integer(10)).unwrap();
        assert_eq!(map.get(1).unwrap(), Some(Value::Integer(10)));
        assert_eq!(map.remove(1).unwrap(), Some(Value::Integer(10)));
        assert_eq!(map.get(1).unwrap(), None);
    }

    #[test]
    fn test_map_put_replaces() {
        let map = InMemoryMap::new("t");
        map.put(1, Value::Integer(10)).unwrap();
        map.put(1, Value::Integer(20)).unwrap();
        assert_eq!(map.get(1).unwrap(), Some(Value::Integer(20)));
        assert_eq!(map.size().unwrap(), 1);
    }

    #[test]
    fn test_map_put_auto_ascending() {
        let map = InMemoryMap::new("t");
        assert_eq!(map.put_auto(Value::Null).unwrap(), 1);
        assert_eq!(map.put_auto(Value::Null).unwrap(), 2);
        map.put(10, Value::Null).unwrap();
        assert_eq!(map.put_auto(Value::Null).unwrap(), 11);
    }

    #[test]
    fn test_map_first_last_key() {
        let map = InMemoryMap::new("t");
        assert_eq!(map.first_key().unwrap(), None);
        map.put(3, Value::Null).unwrap();
        map.put(1, Value::Null).unwrap();
        map.put(2, Value::Null).unwrap();
        assert_eq!(map.first_key().unwrap(), Some(1));
        assert_eq!(map.last_key().unwrap(), Some(3));
    }

    #[test]
    fn test_map_clear() {
        let map = InMemoryMap::new("t");
        map.put(1, Value::Null).unwrap();
        map.put(2, Value::Null).unwrap();
        map.clear().unwrap();
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn test_map_dropped_rejects_operations() {
        let map = InMemoryMap::new("t");
        map.mark_dropped();
        assert!(map.get(1).is_err());
        assert!(map.put(1, Value::Null).is_err());
        assert!(map.put_auto(Value::Null).is_err());
    }

    #[test]
    fn test_map_rename() {
        let map = InMemoryMap::new("old");
        map.set_name("new");
        assert_eq!(map.name().unwrap(), "new");
    }
}
