//! Capacity-bounded connection registries.
//!
//! Each protocol adapter keeps a registry mapping an endpoint key to a live
//! connection entry. The map itself sits behind a std mutex that is only
//! held for lookups and inserts; entries are `Arc<tokio::sync::Mutex<E>>`
//! so socket I/O happens with the registry lock released. There is no
//! eviction — entries live until closed explicitly.

use crate::errors::EngineError;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// A shared, lockable connection entry.
pub type Entry<E> = Arc<AsyncMutex<E>>;

/// Mutually-exclusive map from endpoint key to connection entry, with a
/// per-protocol capacity bound. Exhaustion fails fast, never blocks.
pub struct ConnectionRegistry<K, E> {
    name: &'static str,
    capacity: usize,
    entries: Mutex<HashMap<K, Entry<E>>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, E> ConnectionRegistry<K, E> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up an existing entry.
    pub fn get(&self, key: &K) -> Option<Entry<E>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Insert a new entry, failing with `CapacityExceeded` when full.
    ///
    /// If the key is already present the existing entry is returned
    /// untouched (connects are idempotent at the registry level).
    pub fn insert(&self, key: K, entry: E) -> Result<Entry<E>, EngineError> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(existing) = entries.get(&key) {
            return Ok(existing.clone());
        }
        if entries.len() >= self.capacity {
            return Err(EngineError::CapacityExceeded(format!(
                "{} registry full ({} entries)",
                self.name, self.capacity
            )));
        }

        let entry = Arc::new(AsyncMutex::new(entry));
        entries.insert(key.clone(), entry.clone());
        debug!(registry = self.name, key = ?key, size = entries.len(), "Registered connection");
        Ok(entry)
    }

    /// Remove an entry. Idempotent: removing an absent key is a no-op.
    ///
    /// Dropping the returned `Arc` releases the transport handle once the
    /// last in-flight user lets go of it.
    pub fn remove(&self, key: &K) -> Option<Entry<E>> {
        let removed = self.entries.lock().unwrap().remove(key);
        if removed.is_some() {
            debug!(registry = self.name, key = ?key, "Removed connection");
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry. Used at engine teardown.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let reg: ConnectionRegistry<String, u32> = ConnectionRegistry::new("test", 4);

        reg.insert("a".to_string(), 1).unwrap();
        assert!(reg.contains(&"a".to_string()));
        assert!(reg.get(&"a".to_string()).is_some());
        assert!(reg.get(&"b".to_string()).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_insert_is_idempotent_per_key() {
        let reg: ConnectionRegistry<String, u32> = ConnectionRegistry::new("test", 4);

        let first = reg.insert("a".to_string(), 1).unwrap();
        let second = reg.insert("a".to_string(), 2).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_capacity_exhaustion_fails_fast() {
        let reg: ConnectionRegistry<u32, ()> = ConnectionRegistry::new("test", 2);

        reg.insert(1, ()).unwrap();
        reg.insert(2, ()).unwrap();

        let err = reg.insert(3, ()).unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded(_)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let reg: ConnectionRegistry<u32, ()> = ConnectionRegistry::new("test", 2);
        reg.insert(1, ()).unwrap();

        assert!(reg.remove(&1).is_some());
        assert!(reg.remove(&1).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_remove_frees_capacity() {
        let reg: ConnectionRegistry<u32, ()> = ConnectionRegistry::new("test", 1);
        reg.insert(1, ()).unwrap();
        assert!(reg.insert(2, ()).is_err());

        reg.remove(&1);
        assert!(reg.insert(2, ()).is_ok());
    }
}
