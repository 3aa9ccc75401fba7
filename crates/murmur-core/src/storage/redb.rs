//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! call, including a whole [`WriteOp`] batch, is one write transaction.

use std::{path::Path, sync::Arc};

use redb::{Database, TableDefinition};

use super::{SecureStorage, StorageError, WriteOp};

/// Table: secure
/// Key: namespaced storage key (UTF-8)
/// Value: opaque bytes (CBOR-encoded state)
const SECURE: TableDefinition<&str, &[u8]> = TableDefinition::new("secure");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(SECURE).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl SecureStorage for RedbStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SECURE).map_err(|e| StorageError::Io(e.to_string()))?;

        let value = table.get(key).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.apply(&[WriteOp::Put { key: key.to_string(), value: value.to_vec() }])
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.apply(&[WriteOp::Delete { key: key.to_string() }])
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SECURE).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut keys = Vec::new();
        for result in table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }

        Ok(keys)
    }

    fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(SECURE).map_err(|e| StorageError::Io(e.to_string()))?;

            for op in batch {
                match op {
                    WriteOp::Put { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(|e| StorageError::Io(e.to_string()))?;
                    },
                    WriteOp::Delete { key } => {
                        table.remove(key.as_str()).map_err(|e| StorageError::Io(e.to_string()))?;
                    },
                }
            }
        }

        // Dropping an uncommitted transaction aborts it
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.set("keystore/state", b"state").unwrap();
        assert_eq!(storage.get("keystore/state").unwrap(), Some(b"state".to_vec()));
        assert_eq!(storage.get("missing").unwrap(), None);
    }

    #[test]
    fn delete_removes_value() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.set("k", b"v").unwrap();
        storage.delete("k").unwrap();
        storage.delete("k").unwrap();

        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn list_keys_stops_at_prefix_end() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.set("group/g1/1/alice", b"").unwrap();
        storage.set("group/g1/1/bob", b"").unwrap();
        storage.set("group/g2/1/alice", b"").unwrap();
        storage.set("group-index/g1", b"").unwrap();

        assert_eq!(
            storage.list_keys("group/g1/").unwrap(),
            vec!["group/g1/1/alice", "group/g1/1/bob"]
        );
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage
                .apply(&[
                    WriteOp::Put { key: "a".to_string(), value: b"1".to_vec() },
                    WriteOp::Put { key: "b".to_string(), value: b"2".to_vec() },
                ])
                .unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.get("b").unwrap(), Some(b"2".to_vec()));
    }
}
