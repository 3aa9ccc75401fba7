//! One installation's secure store.
//!
//! Key store, trust store and mapping vault share a single storage backend.
//! Each CLI invocation opens the store, runs one operation and exits.

use std::path::Path;

use murmur_core::{
    CoreConfig, EncryptedRecord, IdentityChange, IdentityKey, KeyStore, MappingVault, PreKeyBundle,
    RedbStorage, SafetyNumber, SecureStorage, SystemEnv, TrustStore, VaultError,
};
use murmur_crypto::RustCryptoPrimitives;
use tracing::info;

use crate::error::CliError;

/// Components of the local installation over one storage backend.
pub struct LocalStore<S> {
    keystore: KeyStore<S, RustCryptoPrimitives, SystemEnv>,
    trust: TrustStore<S>,
    vault: MappingVault<S, RustCryptoPrimitives, SystemEnv>,
}

impl LocalStore<RedbStorage> {
    /// Open or create the redb store at `path`.
    pub fn open(path: impl AsRef<Path>, config: CoreConfig) -> Result<Self, CliError> {
        let storage = RedbStorage::open(path)?;
        Self::with_storage(storage, RustCryptoPrimitives::from_os_entropy()?, config)
    }
}

impl<S: SecureStorage> LocalStore<S> {
    /// Build the components over an existing backend.
    pub fn with_storage(
        storage: S,
        primitives: RustCryptoPrimitives,
        config: CoreConfig,
    ) -> Result<Self, CliError> {
        let env = SystemEnv::new();
        Ok(Self {
            keystore: KeyStore::open(storage.clone(), primitives.clone(), env, config)?,
            trust: TrustStore::new(storage.clone()),
            vault: MappingVault::new(storage, primitives, env),
        })
    }

    /// Create the identity on first run; later runs return the existing one.
    pub fn init(&self) -> Result<IdentityKey, CliError> {
        let identity = self.keystore.generate_identity()?;
        info!(registration_id = identity.registration_id, "identity ready");
        Ok(identity.public())
    }

    /// Public identity of this installation.
    pub fn identity(&self) -> Result<IdentityKey, CliError> {
        self.keystore.identity().map(|identity| identity.public()).ok_or(CliError::NotInitialized)
    }

    /// Top up the prekey pool to at least `min_one_time` keys and return the
    /// bundle to publish.
    pub fn bundle(&self, min_one_time: u32) -> Result<PreKeyBundle, CliError> {
        self.identity()?;
        Ok(self.keystore.ensure_pre_keys(min_one_time)?)
    }

    /// One-time prekeys left in the pool.
    pub fn one_time_pre_key_count(&self) -> usize {
        self.keystore.one_time_pre_key_count()
    }

    /// Safety number with `peer_id`.
    ///
    /// The first key presented for a peer is remembered; a different key on
    /// a later call is refused until [`trust`](Self::trust) accepts it.
    pub fn safety_number(
        &self,
        local_id: &str,
        peer_id: &str,
        peer_key: &IdentityKey,
    ) -> Result<SafetyNumber, CliError> {
        let local = self.identity()?;
        if let IdentityChange::Changed { .. } = self.trust.check_and_remember(peer_id, peer_key)? {
            return Err(CliError::IdentityChanged { peer: peer_id.to_string() });
        }
        Ok(SafetyNumber::new(local_id, &local, peer_id, peer_key))
    }

    /// Accept `peer_key` for `peer_id` after out-of-band verification.
    pub fn trust(&self, peer_id: &str, peer_key: &IdentityKey) -> Result<(), CliError> {
        Ok(self.trust.trust(peer_id, peer_key)?)
    }

    /// Forget the key remembered for `peer_id`.
    pub fn forget(&self, peer_id: &str) -> Result<(), CliError> {
        self.trust.forget(peer_id)?;
        info!(peer = peer_id, "identity forgotten");
        Ok(())
    }

    /// Seal `payload` as the record of `owner`, replacing any previous one.
    pub fn seal(&self, owner: &str, payload: &[u8]) -> Result<EncryptedRecord, CliError> {
        Ok(self.vault.encrypt(owner, payload)?)
    }

    /// Decrypt the stored record of `owner`.
    pub fn open_record(&self, owner: &str) -> Result<Vec<u8>, CliError> {
        let record = self
            .vault
            .record(owner)?
            .ok_or_else(|| VaultError::NoRecord { owner: owner.to_string() })?;
        Ok(self.vault.decrypt(owner, &record)?)
    }

    /// Re-encrypt the record of `owner` under a fresh key.
    pub fn rotate(&self, owner: &str) -> Result<EncryptedRecord, CliError> {
        Ok(self.vault.rotate_key(owner)?)
    }
}

/// Parse a hex `dh ‖ signing` identity key.
pub fn parse_identity(hex_key: &str) -> Result<IdentityKey, CliError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| CliError::InvalidHex { field: "identity key", reason: e.to_string() })?;
    IdentityKey::from_slice(&bytes).map_err(CliError::InvalidIdentity)
}
