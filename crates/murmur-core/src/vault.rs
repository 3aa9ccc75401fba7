//! Mapping vault.
//!
//! Encrypts small identifier records under per-owner keys, independent of
//! any messaging session. The plaintext embeds the owner id, which is checked
//! on decrypt in addition to the AEAD tag.
//!
//! # Key rotation
//!
//! ```text
//! 1. decrypt current record with the active key
//! 2. load or create the pending key       (vault/pending/{owner})
//! 3. re-encrypt under the pending key
//! 4. one atomic batch: store new key and record, point active at the
//!    new key, delete pending and the old key
//! ```
//!
//! A crash before step 4 leaves the old key and record valid. A retry reuses
//! the pending key, so the end state always has one active key and one
//! decryptable record.

use std::sync::PoisonError;

use murmur_crypto::{CryptoPrimitives, NONCE_SIZE, SymmetricKey, TAG_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    env::Environment,
    error::VaultError,
    locks::LockTable,
    storage::{self, SecureStorage, StorageError, WriteOp},
};

/// AEAD algorithm of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmId {
    /// XChaCha20-Poly1305 with a 24-byte random nonce
    XChaCha20Poly1305,
}

impl AlgorithmId {
    fn as_byte(self) -> u8 {
        match self {
            Self::XChaCha20Poly1305 => 1,
        }
    }
}

/// Record format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordVersion {
    /// CBOR plaintext `{owner_id, created_at, payload}`
    V1,
}

impl RecordVersion {
    fn as_byte(self) -> u8 {
        match self {
            Self::V1 => 1,
        }
    }
}

/// One encrypted record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    /// `nonce ‖ ciphertext ‖ tag`
    pub ciphertext: Vec<u8>,
    /// Id of the owner key that encrypted this record
    pub key_id: String,
    /// AEAD algorithm
    pub algorithm: AlgorithmId,
    /// Plaintext format
    pub version: RecordVersion,
    /// Encryption time (Unix seconds)
    pub created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct RecordPlaintext {
    owner_id: String,
    created_at: u64,
    payload: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
enum StoredVaultKey {
    V1 { key_id: String, owner: String, key: SymmetricKey, created_at: u64 },
}

#[derive(Serialize, Deserialize)]
enum StoredActiveKey {
    V1 { key_id: String },
}

#[derive(Serialize, Deserialize)]
enum StoredRecord {
    V1(EncryptedRecord),
}

/// Per-owner record encryption with crash-safe key rotation.
#[derive(Clone)]
pub struct MappingVault<S, P, E> {
    storage: S,
    primitives: P,
    env: E,
    locks: LockTable<String>,
}

impl<S: SecureStorage, P: CryptoPrimitives, E: Environment> MappingVault<S, P, E> {
    /// Create a vault over `storage`.
    pub fn new(storage: S, primitives: P, env: E) -> Self {
        Self { storage, primitives, env, locks: LockTable::default() }
    }

    /// Encrypt `payload` for `owner` and store it as the owner's record.
    ///
    /// The owner key is generated on first use.
    pub fn encrypt(&self, owner: &str, payload: &[u8]) -> Result<EncryptedRecord, VaultError> {
        let lock = self.locks.get(&owner.to_string());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut batch = Vec::new();
        let key = match self.active_key(owner)? {
            Some(key) => key,
            None => {
                let key = self.new_key(owner);
                let StoredVaultKey::V1 { key_id, .. } = &key;
                batch.push(put(&key_storage_key(key_id), &key)?);
                batch.push(put(
                    &active_storage_key(owner),
                    &StoredActiveKey::V1 { key_id: key_id.clone() },
                )?);
                debug!(owner, key_id = %key_id, "vault key created");
                key
            },
        };

        let record = self.seal(owner, payload, &key)?;
        batch.push(put(&record_storage_key(owner), &StoredRecord::V1(record.clone()))?);
        self.storage.apply(&batch)?;

        Ok(record)
    }

    /// Decrypt `record` on behalf of `owner`.
    ///
    /// Fails with [`VaultError::OwnerMismatch`] if the record decrypts but
    /// embeds a different owner, whichever key was used.
    pub fn decrypt(&self, owner: &str, record: &EncryptedRecord) -> Result<Vec<u8>, VaultError> {
        let Some(StoredVaultKey::V1 { key, .. }) =
            storage::load::<_, StoredVaultKey>(&self.storage, &key_storage_key(&record.key_id))?
        else {
            return Err(VaultError::DecryptionFailed);
        };

        let aad = record_aad(&record.key_id, record.algorithm, record.version);
        let sealed = match record.algorithm {
            AlgorithmId::XChaCha20Poly1305 => {
                open(&self.primitives, &key, &record.ciphertext, &aad)?
            },
        };
        let plaintext: RecordPlaintext = match record.version {
            RecordVersion::V1 => {
                storage::decode(&sealed).map_err(|_| VaultError::DecryptionFailed)?
            },
        };

        if !self.primitives.constant_time_eq(plaintext.owner_id.as_bytes(), owner.as_bytes()) {
            return Err(VaultError::OwnerMismatch);
        }
        Ok(plaintext.payload)
    }

    /// The stored record of `owner`, if any.
    pub fn record(&self, owner: &str) -> Result<Option<EncryptedRecord>, StorageError> {
        let stored = storage::load::<_, StoredRecord>(&self.storage, &record_storage_key(owner))?;
        Ok(stored.map(|StoredRecord::V1(record)| record))
    }

    /// Id of the key currently used for `owner`.
    pub fn active_key_id(&self, owner: &str) -> Result<Option<String>, StorageError> {
        let stored =
            storage::load::<_, StoredActiveKey>(&self.storage, &active_storage_key(owner))?;
        Ok(stored.map(|StoredActiveKey::V1 { key_id }| key_id))
    }

    /// Re-encrypt the owner's record under a fresh key and retire the old
    /// key. Safe to retry after any failure.
    pub fn rotate_key(&self, owner: &str) -> Result<EncryptedRecord, VaultError> {
        let lock = self.locks.get(&owner.to_string());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let record = self
            .record(owner)?
            .ok_or_else(|| VaultError::NoRecord { owner: owner.to_string() })?;
        let payload = self.decrypt(owner, &record)?;

        let stored_pending =
            storage::load::<_, StoredVaultKey>(&self.storage, &pending_storage_key(owner))?;
        let pending = match stored_pending {
            Some(pending) => {
                debug!(owner, "resuming interrupted rotation");
                pending
            },
            None => {
                let pending = self.new_key(owner);
                storage::store(&self.storage, &pending_storage_key(owner), &pending)?;
                pending
            },
        };
        let StoredVaultKey::V1 { key_id: new_key_id, .. } = &pending;

        let rotated = self.seal(owner, &payload, &pending)?;

        let mut batch = vec![
            put(&key_storage_key(new_key_id), &pending)?,
            put(&record_storage_key(owner), &StoredRecord::V1(rotated.clone()))?,
            put(&active_storage_key(owner), &StoredActiveKey::V1 { key_id: new_key_id.clone() })?,
            WriteOp::Delete { key: pending_storage_key(owner) },
        ];
        if record.key_id != *new_key_id {
            batch.push(WriteOp::Delete { key: key_storage_key(&record.key_id) });
        }
        self.storage.apply(&batch)?;

        info!(owner, old_key_id = %record.key_id, new_key_id = %new_key_id, "vault key rotated");
        Ok(rotated)
    }

    fn active_key(&self, owner: &str) -> Result<Option<StoredVaultKey>, StorageError> {
        let Some(key_id) = self.active_key_id(owner)? else {
            return Ok(None);
        };
        storage::load(&self.storage, &key_storage_key(&key_id))
    }

    fn new_key(&self, owner: &str) -> StoredVaultKey {
        let mut id = [0u8; 16];
        self.primitives.random_bytes(&mut id);

        StoredVaultKey::V1 {
            key_id: hex::encode(id),
            owner: owner.to_string(),
            key: self.primitives.generate_symmetric_key(),
            created_at: self.env.wall_clock_secs(),
        }
    }

    fn seal(
        &self,
        owner: &str,
        payload: &[u8],
        key: &StoredVaultKey,
    ) -> Result<EncryptedRecord, VaultError> {
        let StoredVaultKey::V1 { key_id, key, .. } = key;
        let created_at = self.env.wall_clock_secs();

        let plaintext = storage::encode(&RecordPlaintext {
            owner_id: owner.to_string(),
            created_at,
            payload: payload.to_vec(),
        })?;
        let algorithm = AlgorithmId::XChaCha20Poly1305;
        let version = RecordVersion::V1;
        let aad = record_aad(key_id, algorithm, version);

        let nonce = self.primitives.random_nonce();
        let sealed = self
            .primitives
            .aead_encrypt(key, &nonce, &plaintext, &aad)
            .map_err(VaultError::Crypto)?;
        let mut ciphertext = Vec::with_capacity(NONCE_SIZE + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);

        Ok(EncryptedRecord { ciphertext, key_id: key_id.clone(), algorithm, version, created_at })
    }
}

/// `key_id ‖ algorithm ‖ version`, so none of them can be swapped.
fn record_aad(key_id: &str, algorithm: AlgorithmId, version: RecordVersion) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.len() + 2);
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(algorithm.as_byte());
    aad.push(version.as_byte());
    aad
}

/// Decrypt `nonce ‖ ciphertext ‖ tag`.
fn open<P: CryptoPrimitives>(
    primitives: &P,
    key: &SymmetricKey,
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, VaultError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(VaultError::DecryptionFailed);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(nonce);

    primitives
        .aead_decrypt(key, &nonce_bytes, ciphertext, aad)
        .map_err(|_| VaultError::DecryptionFailed)
}

fn put<T: Serialize>(key: &str, value: &T) -> Result<WriteOp, StorageError> {
    Ok(WriteOp::Put { key: key.to_string(), value: storage::encode(value)? })
}

fn key_storage_key(key_id: &str) -> String {
    format!("vault/key/{key_id}")
}

fn active_storage_key(owner: &str) -> String {
    format!("vault/active/{}", hex::encode(owner))
}

fn pending_storage_key(owner: &str) -> String {
    format!("vault/pending/{}", hex::encode(owner))
}

fn record_storage_key(owner: &str) -> String {
    format!("vault/record/{}", hex::encode(owner))
}
