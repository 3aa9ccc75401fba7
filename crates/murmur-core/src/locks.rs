//! Per-partition locks.
//!
//! Encrypt/decrypt on one session or sender chain must be serialized, while
//! different sessions and chains run in parallel. A `LockTable` hands out one
//! lock per partition key.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

/// Lazily-created lock per key. Clones share the same table.
pub(crate) struct LockTable<K, L = Mutex<()>> {
    locks: Arc<Mutex<HashMap<K, Arc<L>>>>,
}

impl<K, L> Clone for LockTable<K, L> {
    fn clone(&self) -> Self {
        Self { locks: Arc::clone(&self.locks) }
    }
}

impl<K, L> Default for LockTable<K, L> {
    fn default() -> Self {
        Self { locks: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<K: Eq + Hash + Clone, L: Default> LockTable<K, L> {
    /// Lock for `key`, created on first use.
    pub(crate) fn get(&self, key: &K) -> Arc<L> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_lock() {
        let table: LockTable<String> = LockTable::default();

        let a = table.get(&"alice".to_string());
        let b = table.get(&"alice".to_string());
        let c = table.get(&"bob".to_string());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn clones_share_locks() {
        let table: LockTable<u32> = LockTable::default();
        let clone = table.clone();

        assert!(Arc::ptr_eq(&table.get(&1), &clone.get(&1)));
    }
}
