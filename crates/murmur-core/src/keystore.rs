//! Identity and prekey store.
//!
//! Owns the long-term identity key pair and the prekey pool, persisted under
//! `keystore/state`. Every mutation is prepared on a copy of the state,
//! persisted, and only then made visible, so a storage failure leaves both
//! memory and disk at the previous state.
//!
//! The one-time prekey pool is the only structure shared by concurrent
//! handshake responders. [`KeyStore::consume_one_time_pre_key`] is an atomic
//! claim: exactly one caller receives a given key.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use murmur_crypto::{
    CryptoError, CryptoPrimitives, DhKeyPair, PublicKey, Signature, SigningKeyPair,
    SigningPublicKey,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::CoreConfig,
    env::Environment,
    error::KeyStoreError,
    storage::{self, SecureStorage},
};

/// Storage key for the persisted key store.
const STATE_KEY: &str = "keystore/state";

/// Public identity: X25519 key for agreement, Ed25519 key for signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Key-agreement public key
    pub dh: PublicKey,
    /// Signature verifying key
    pub signing: SigningPublicKey,
}

impl IdentityKey {
    /// Encoded length: agreement key followed by verifying key.
    pub const ENCODED_LEN: usize = 64;

    /// `dh ‖ signing`.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[..32].copy_from_slice(self.dh.as_bytes());
        bytes[32..].copy_from_slice(self.signing.as_bytes());
        bytes
    }

    /// Parse the `dh ‖ signing` encoding.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let encoded: &[u8; Self::ENCODED_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: Self::ENCODED_LEN, actual: bytes.len() }
        })?;
        let (dh, signing) = encoded.split_at(32);
        let mut signing_bytes = [0u8; 32];
        signing_bytes.copy_from_slice(signing);
        Ok(Self {
            dh: PublicKey::from_slice(dh)?,
            signing: SigningPublicKey::from_bytes(signing_bytes),
        })
    }
}

/// Long-term identity. Created once per installation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// Key-agreement pair
    pub dh: DhKeyPair,
    /// Signing pair
    pub signing: SigningKeyPair,
    /// Random 31-bit id published with every bundle
    pub registration_id: u32,
}

impl IdentityKeyPair {
    /// Public half.
    pub fn public(&self) -> IdentityKey {
        IdentityKey { dh: self.dh.public, signing: self.signing.public }
    }
}

/// Medium-term prekey signed by the identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Prekey id
    pub id: u32,
    /// Key pair
    pub key_pair: DhKeyPair,
    /// Signature over the identity and this key, see [`signed_pre_key_message`]
    pub signature: Signature,
    /// Creation time (Unix seconds)
    pub created_at: u64,
    /// When a newer signed prekey replaced this one
    pub superseded_at: Option<u64>,
}

/// Single-use prekey.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Prekey id
    pub id: u32,
    /// Key pair
    pub key_pair: DhKeyPair,
}

/// Public half of a one-time prekey, as published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Prekey id
    pub id: u32,
    /// Public key
    pub public: PublicKey,
}

/// Published bundle a peer needs to start a session with us.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Owner's registration id
    pub registration_id: u32,
    /// Owner's identity
    pub identity_key: IdentityKey,
    /// Id of the signed prekey
    pub signed_pre_key_id: u32,
    /// Signed prekey
    pub signed_pre_key: PublicKey,
    /// Identity signature over the signed prekey
    pub signed_pre_key_signature: Signature,
    /// Optional one-time prekey
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Verify the signed prekey signature against the bundle identity.
    pub fn verify<P: CryptoPrimitives>(&self, primitives: &P) -> Result<(), CryptoError> {
        let message = signed_pre_key_message(
            &self.identity_key,
            self.signed_pre_key_id,
            &self.signed_pre_key,
        );
        primitives.verify(&self.identity_key.signing, &message, &self.signed_pre_key_signature)
    }
}

/// Bytes covered by a signed prekey signature:
/// `identity dh ‖ identity signing ‖ id (u32 BE) ‖ signed prekey`.
///
/// Binding both identity components prevents substituting either one.
pub fn signed_pre_key_message(identity: &IdentityKey, id: u32, public: &PublicKey) -> Vec<u8> {
    let mut message = Vec::with_capacity(IdentityKey::ENCODED_LEN + 4 + 32);
    message.extend_from_slice(&identity.to_bytes());
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(public.as_bytes());
    message
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PooledPreKey {
    key: OneTimePreKey,
    /// Already handed out in a bundle
    published: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct KeyStoreState {
    identity: Option<IdentityKeyPair>,
    /// Oldest first; the last unsuperseded entry is current
    signed_pre_keys: Vec<SignedPreKey>,
    one_time_pre_keys: BTreeMap<u32, PooledPreKey>,
    next_signed_pre_key_id: u32,
    next_one_time_pre_key_id: u32,
}

impl KeyStoreState {
    fn current_signed_pre_key(&self) -> Option<&SignedPreKey> {
        self.signed_pre_keys.iter().rev().find(|spk| spk.superseded_at.is_none())
    }
}

/// Persisted form. Each format version is handled exhaustively.
#[derive(Serialize, Deserialize)]
enum StoredKeyStore {
    V1(KeyStoreState),
}

/// Identity and prekey store.
///
/// Clone shares the same underlying state.
#[derive(Clone)]
pub struct KeyStore<S, P, E> {
    storage: S,
    primitives: P,
    env: E,
    config: CoreConfig,
    state: Arc<Mutex<KeyStoreState>>,
}

impl<S: SecureStorage, P: CryptoPrimitives, E: Environment> KeyStore<S, P, E> {
    /// Load the key store from storage, or start empty.
    pub fn open(
        storage: S,
        primitives: P,
        env: E,
        config: CoreConfig,
    ) -> Result<Self, KeyStoreError> {
        let state = match storage::load::<_, StoredKeyStore>(&storage, STATE_KEY)? {
            Some(StoredKeyStore::V1(state)) => state,
            None => KeyStoreState::default(),
        };

        debug!(
            has_identity = state.identity.is_some(),
            signed_pre_keys = state.signed_pre_keys.len(),
            one_time_pre_keys = state.one_time_pre_keys.len(),
            "key store opened"
        );

        Ok(Self { storage, primitives, env, config, state: Arc::new(Mutex::new(state)) })
    }

    /// Primitives this store generates keys with.
    pub fn primitives(&self) -> &P {
        &self.primitives
    }

    /// Current identity, if one was generated.
    pub fn identity(&self) -> Option<IdentityKeyPair> {
        self.lock().identity.clone()
    }

    /// Return the installation identity, generating it on first call.
    pub fn generate_identity(&self) -> Result<IdentityKeyPair, KeyStoreError> {
        let mut guard = self.lock();
        if let Some(identity) = &guard.identity {
            return Ok(identity.clone());
        }

        let mut next = guard.clone();
        let identity = self.new_identity();
        next.identity = Some(identity.clone());

        self.persist(&next)?;
        *guard = next;

        info!(registration_id = identity.registration_id, "identity generated");
        Ok(identity)
    }

    /// Replace the identity (explicit user action).
    ///
    /// All prekeys are discarded because they are signed by the old identity.
    /// Callers must publish a fresh bundle afterwards.
    pub fn rotate_identity(&self) -> Result<IdentityKeyPair, KeyStoreError> {
        let mut guard = self.lock();

        let identity = self.new_identity();
        let next = KeyStoreState {
            identity: Some(identity.clone()),
            next_signed_pre_key_id: guard.next_signed_pre_key_id,
            next_one_time_pre_key_id: guard.next_one_time_pre_key_id,
            ..KeyStoreState::default()
        };

        self.persist(&next)?;
        *guard = next;

        info!(registration_id = identity.registration_id, "identity rotated");
        Ok(identity)
    }

    /// Delete every key (account deletion).
    pub fn destroy(&self) -> Result<(), KeyStoreError> {
        let mut guard = self.lock();
        self.storage.delete(STATE_KEY)?;
        *guard = KeyStoreState::default();

        info!("key store destroyed");
        Ok(())
    }

    /// Top up one-time prekeys, rotate an expired signed prekey, purge
    /// superseded signed prekeys past retention, and return a bundle to
    /// publish.
    ///
    /// The bundle carries a one-time prekey that has not been published
    /// before, if one is available.
    pub fn ensure_pre_keys(&self, min_one_time: u32) -> Result<PreKeyBundle, KeyStoreError> {
        let now = self.env.wall_clock_secs();
        let mut guard = self.lock();
        let mut next = guard.clone();

        let identity = next.identity.clone().ok_or(KeyStoreError::NoIdentity)?;

        let rotation = self.config.signed_prekey_rotation_secs;
        let unexpired = next
            .current_signed_pre_key()
            .filter(|spk| now.saturating_sub(spk.created_at) < rotation)
            .cloned();
        let current = match unexpired {
            Some(spk) => spk,
            None => {
                for spk in &mut next.signed_pre_keys {
                    spk.superseded_at.get_or_insert(now);
                }
                let spk = self.new_signed_pre_key(&identity, next.next_signed_pre_key_id, now);
                next.next_signed_pre_key_id = next.next_signed_pre_key_id.wrapping_add(1);
                next.signed_pre_keys.push(spk.clone());
                info!(id = spk.id, "signed prekey rotated");
                spk
            },
        };

        let retention = self.config.signed_prekey_retention_secs;
        let before = next.signed_pre_keys.len();
        next.signed_pre_keys
            .retain(|spk| spk.superseded_at.is_none_or(|at| now.saturating_sub(at) < retention));
        let purged = before - next.signed_pre_keys.len();
        if purged > 0 {
            debug!(purged, "superseded signed prekeys purged");
        }

        // Published keys stay claimable for in-flight handshakes but no
        // longer count toward the pool a bundle can draw from
        let unpublished =
            next.one_time_pre_keys.values().filter(|pooled| !pooled.published).count();
        let unpublished = u32::try_from(unpublished).unwrap_or(u32::MAX);
        if unpublished < min_one_time {
            let target = min_one_time.max(self.config.one_time_prekey_batch);
            for _ in unpublished..target {
                let id = next.next_one_time_pre_key_id;
                next.next_one_time_pre_key_id = id.wrapping_add(1);
                let key = OneTimePreKey { id, key_pair: self.primitives.generate_dh_key_pair() };
                next.one_time_pre_keys.insert(id, PooledPreKey { key, published: false });
            }
            info!(
                generated = target - unpublished,
                pool = next.one_time_pre_keys.len(),
                "one-time prekeys topped up"
            );
        }

        let one_time_pre_key = next
            .one_time_pre_keys
            .values_mut()
            .find(|pooled| !pooled.published)
            .map(|pooled| {
                pooled.published = true;
                OneTimePreKeyPublic { id: pooled.key.id, public: pooled.key.key_pair.public }
            });

        let bundle = PreKeyBundle {
            registration_id: identity.registration_id,
            identity_key: identity.public(),
            signed_pre_key_id: current.id,
            signed_pre_key: current.key_pair.public,
            signed_pre_key_signature: current.signature,
            one_time_pre_key,
        };

        self.persist(&next)?;
        *guard = next;

        Ok(bundle)
    }

    /// Claim a one-time prekey: return it and delete it from the pool.
    ///
    /// Returns `None` if the key was already consumed or never existed. This
    /// is a valid protocol state, not an error.
    pub fn consume_one_time_pre_key(
        &self,
        id: u32,
    ) -> Result<Option<OneTimePreKey>, KeyStoreError> {

        let mut guard = self.lock();
        if !guard.one_time_pre_keys.contains_key(&id) {
            return Ok(None);
        }

        let mut next = guard.clone();
        let claimed = next.one_time_pre_keys.remove(&id).map(|pooled| pooled.key);

        self.persist(&next)?;
        *guard = next;

        debug!(id, remaining = guard.one_time_pre_keys.len(), "one-time prekey consumed");
        Ok(claimed)
    }

    /// Look up a one-time prekey without consuming it.
    pub fn one_time_pre_key(&self, id: u32) -> Option<OneTimePreKey> {
        self.lock().one_time_pre_keys.get(&id).map(|pooled| pooled.key.clone())
    }

    /// Number of unconsumed one-time prekeys.
    pub fn one_time_pre_key_count(&self) -> usize {
        self.lock().one_time_pre_keys.len()
    }

    /// Signed prekey by id, if still retained.
    pub fn signed_pre_key_for(&self, id: u32) -> Option<SignedPreKey> {
        self.lock().signed_pre_keys.iter().find(|spk| spk.id == id).cloned()
    }

    fn new_identity(&self) -> IdentityKeyPair {
        IdentityKeyPair {
            dh: self.primitives.generate_dh_key_pair(),
            signing: self.primitives.generate_signing_key_pair(),
            registration_id: (self.primitives.random_u32() & 0x7FFF_FFFF).max(1),
        }
    }

    fn new_signed_pre_key(&self, identity: &IdentityKeyPair, id: u32, now: u64) -> SignedPreKey {
        let key_pair = self.primitives.generate_dh_key_pair();
        let message = signed_pre_key_message(&identity.public(), id, &key_pair.public);
        let signature = self.primitives.sign(&identity.signing.secret, &message);

        SignedPreKey { id, key_pair, signature, created_at: now, superseded_at: None }
    }

    fn persist(&self, state: &KeyStoreState) -> Result<(), KeyStoreError> {
        storage::store(&self.storage, STATE_KEY, &StoredKeyStore::V1(state.clone()))?;
        Ok(())
    }

    // State is only replaced after a successful persist, so a poisoned lock
    // still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, KeyStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
