//! In-memory storage for tests and simulation.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{SecureStorage, StorageError, WriteOp};

/// In-memory storage implementation for testing and simulation
///
/// Uses a `BTreeMap` so prefix listing is an ordered range scan. All state is
/// wrapped in Arc<Mutex<>> to allow Clone and concurrent access. A poisoned
/// lock surfaces as [`StorageError::Io`].
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    ///
    /// Useful for debugging and testing.
    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or_default()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("memory storage lock poisoned".to_string()))
    }
}

impl SecureStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.lock()?;
        Ok(entries
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        // Single lock acquisition makes the batch atomic
        let mut entries = self.lock()?;
        for op in batch {
            match op {
                WriteOp::Put { key, value } => {
                    entries.insert(key.clone(), value.clone());
                },
                WriteOp::Delete { key } => {
                    entries.remove(key);
                },
            }
        }
        Ok(())
    }
}
