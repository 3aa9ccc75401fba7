//! Identity trust store (trust on first use).
//!
//! The first identity key seen for a peer is remembered. A different key
//! later is reported as [`IdentityChange::Changed`] and is not remembered
//! until the caller re-trusts it explicitly.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    keystore::IdentityKey,
    storage::{self, SecureStorage, StorageError},
};

/// How a presented identity key relates to the remembered one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityChange {
    /// No key was remembered for this peer
    New,
    /// Same key as remembered
    Unchanged,
    /// A different key was remembered
    Changed {
        /// The remembered key
        previous: IdentityKey,
    },
}

#[derive(Serialize, Deserialize)]
enum StoredTrust {
    V1(IdentityKey),
}

/// Remembered peer identity keys, under `trust/{hex(peer)}`.
#[derive(Clone)]
pub struct TrustStore<S> {
    storage: S,
}

impl<S: SecureStorage> TrustStore<S> {
    /// Create a trust store over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Compare `identity` with the remembered key without changing anything.
    pub fn check(
        &self,
        peer: &str,
        identity: &IdentityKey,
    ) -> Result<IdentityChange, StorageError> {
        Ok(match self.trusted(peer)? {
            None => IdentityChange::New,
            Some(known) if known == *identity => IdentityChange::Unchanged,
            Some(previous) => IdentityChange::Changed { previous },
        })
    }

    /// Like [`check`](Self::check), but remembers `identity` if the peer is new.
    pub fn check_and_remember(
        &self,
        peer: &str,
        identity: &IdentityKey,
    ) -> Result<IdentityChange, StorageError> {

        let change = self.check(peer, identity)?;
        match change {
            IdentityChange::New => self.store(peer, identity)?,
            IdentityChange::Unchanged => {},
            IdentityChange::Changed { .. } => warn!(peer, "identity key changed"),
        }
        Ok(change)
    }

    /// Remember `identity` for `peer`, replacing any previous key.
    pub fn trust(&self, peer: &str, identity: &IdentityKey) -> Result<(), StorageError> {
        self.store(peer, identity)?;
        info!(peer, "identity trusted");
        Ok(())
    }

    /// The remembered key for `peer`.
    pub fn trusted(&self, peer: &str) -> Result<Option<IdentityKey>, StorageError> {
        let stored = storage::load::<_, StoredTrust>(&self.storage, &trust_key(peer))?;
        Ok(stored.map(|StoredTrust::V1(identity)| identity))
    }

    /// Forget the remembered key for `peer`.
    pub fn forget(&self, peer: &str) -> Result<(), StorageError> {
        self.storage.delete(&trust_key(peer))
    }

    fn store(&self, peer: &str, identity: &IdentityKey) -> Result<(), StorageError> {
        storage::store(&self.storage, &trust_key(peer), &StoredTrust::V1(*identity))
    }
}

fn trust_key(peer: &str) -> String {
    format!("trust/{}", hex::encode(peer))
}

#[cfg(test)]
mod tests {
    use murmur_crypto::{CryptoPrimitives, RustCryptoPrimitives};

    use super::*;
    use crate::storage::MemoryStorage;

    fn identity(seed: u8) -> IdentityKey {
        let primitives = RustCryptoPrimitives::from_seed([seed; 32]);
        IdentityKey {
            dh: primitives.generate_dh_key_pair().public,
            signing: primitives.generate_signing_key_pair().public,
        }
    }

    #[test]
    fn first_use_is_remembered() {
        let trust = TrustStore::new(MemoryStorage::new());
        let bob = identity(1);

        assert_eq!(trust.check_and_remember("bob", &bob).unwrap(), IdentityChange::New);
        assert_eq!(trust.check_and_remember("bob", &bob).unwrap(), IdentityChange::Unchanged);
        assert_eq!(trust.trusted("bob").unwrap(), Some(bob));
    }

    #[test]
    fn changed_key_needs_explicit_trust() {
        let trust = TrustStore::new(MemoryStorage::new());
        let old = identity(1);
        let new = identity(2);
        trust.check_and_remember("bob", &old).unwrap();

        assert_eq!(
            trust.check_and_remember("bob", &new).unwrap(),
            IdentityChange::Changed { previous: old }
        );
        assert_eq!(trust.trusted("bob").unwrap(), Some(old));

        trust.trust("bob", &new).unwrap();
        assert_eq!(trust.check("bob", &new).unwrap(), IdentityChange::Unchanged);
    }

    #[test]
    fn check_does_not_remember() {
        let trust = TrustStore::new(MemoryStorage::new());

        assert_eq!(trust.check("bob", &identity(1)).unwrap(), IdentityChange::New);
        assert_eq!(trust.trusted("bob").unwrap(), None);

        trust.trust("bob", &identity(1)).unwrap();
        trust.forget("bob").unwrap();
        assert_eq!(trust.trusted("bob").unwrap(), None);
    }
}
