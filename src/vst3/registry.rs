//! Process-wide instance registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Maps instance ids to live objects.
///
/// Ids start at 1, are unique per registry and are never reused for the
/// lifetime of the process. Insertion and removal are serialised by one
/// mutex; hot-path lookups go through the same lock.
pub struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Registry<T> {
        Registry { next_id: AtomicU64::new(1), entries: Mutex::new(HashMap::new()) }
    }
}

impl<T> Registry<T> {
    /// Register a new object under a fresh id.
    pub fn insert(&self, object: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(id, object);
        id
    }

    /// Remove an object, returning it if it was registered.
    pub fn remove(&self, id: u64) -> Option<T> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(&id)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Registry<T> {
    /// Look up an object by id.
    pub fn get(&self, id: u64) -> Option<T> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_are_unique_and_never_reused() {
        let registry = Registry::default();
        let a = registry.insert("a");
        let b = registry.insert("b");
        assert_ne!(a, b);
        registry.remove(a);
        let c = registry.insert("c");
        assert_ne!(c, a);
    }

    #[test]
    fn registrations_balance_over_a_lifecycle() {
        let registry = Registry::default();
        let ids: Vec<u64> = (0..8).map(|i| registry.insert(Arc::new(i))).collect();
        assert_eq!(registry.len(), 8);
        for id in ids {
            assert!(registry.remove(id).is_some());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_clones_the_stored_handle() {
        let registry = Registry::default();
        let id = registry.insert(Arc::new(41));
        assert_eq!(registry.get(id).map(|v| *v), Some(41));
        assert_eq!(registry.get(id + 1).map(|v| *v), None);
    }
}
