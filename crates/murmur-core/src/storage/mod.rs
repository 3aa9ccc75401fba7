//! Secure storage abstraction
//!
//! Byte-oriented key/value storage keyed by opaque strings. The platform
//! keychain or encrypted disk sits behind this trait; the core treats it as a
//! black box whose only error mode is I/O failure.
//!
//! The trait is synchronous. Cryptographic state transitions are short and
//! must not interleave, so they persist before returning.
//!
//! # Key namespaces
//!
//! - `keystore/state`: [`KeyStore`](crate::keystore::KeyStore)
//! - `session/{peer}`: [`SessionStore`](crate::session_store::SessionStore)
//! - `group/{group}/{epoch}/{sender}` and `group-index/{group}`:
//!   [`GroupRatchet`](crate::group::GroupRatchet)
//! - `vault/key/`, `vault/active/`, `vault/pending/` and `vault/record/`:
//!   [`MappingVault`](crate::vault::MappingVault)
//! - `trust/{peer}`: [`TrustStore`](crate::trust::TrustStore)


mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Serialize, de::DeserializeOwned};

pub use self::redb::RedbStorage;

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a value
    Put {
        /// Storage key
        key: String,
        /// New value
        value: Vec<u8>,
    },
    /// Remove a value. Removing an absent key is not an error.
    Delete {
        /// Storage key
        key: String,
    },
}

impl WriteOp {
    /// Storage key this operation touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Secure byte storage.
///
/// Must be Clone (shared by every component), Send + Sync (thread-safe), and
/// synchronous. Implementations share internal state via Arc, so clones access
/// the same underlying storage.
pub trait SecureStorage: Clone + Send + Sync + 'static {
    /// Read a value. `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value, overwriting any existing one.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a value. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in lexicographic order.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Apply every operation or none of them.
    ///
    /// # Invariants
    ///
    /// - Post (success): all operations are visible, in order
    /// - Post (failure): storage is unchanged
    fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError>;
}

/// Encode a value as CBOR.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Read and decode a CBOR value. `None` if the key is absent.
pub fn load<S: SecureStorage, T: DeserializeOwned>(
    storage: &S,
    key: &str,
) -> Result<Option<T>, StorageError> {
    storage.get(key)?.map(|bytes| decode(&bytes)).transpose()
}

/// Encode and write a CBOR value.
pub fn store<S: SecureStorage, T: Serialize>(
    storage: &S,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    storage.set(key, &encode(value)?)
}
