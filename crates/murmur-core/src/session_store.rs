//! Persistent pairwise sessions.
//!
//! One session per peer under `session/{hex(peer)}`. Operations on the same
//! peer are serialized by a per-peer lock; different peers proceed in
//! parallel. A state transition is persisted before the operation returns,
//! and a failed persist discards it.

use std::sync::PoisonError;

use murmur_crypto::CryptoPrimitives;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::CoreConfig,
    error::RatchetError,
    locks::LockTable,
    ratchet::{RatchetMessage, RatchetSession, SessionState},
    storage::{self, SecureStorage, StorageError},
};

const SESSION_PREFIX: &str = "session/";

#[derive(Serialize, Deserialize)]
enum StoredSession {
    V1(SessionState),
}

/// Per-peer session persistence.
#[derive(Clone)]
pub struct SessionStore<S, P> {
    storage: S,
    primitives: P,
    config: CoreConfig,
    locks: LockTable<String>,
}

impl<S: SecureStorage, P: CryptoPrimitives> SessionStore<S, P> {
    /// Create a store over `storage`.
    pub fn new(storage: S, primitives: P, config: CoreConfig) -> Self {
        Self { storage, primitives, config, locks: LockTable::default() }
    }

    /// Whether a session exists for `peer`.
    pub fn contains(&self, peer: &str) -> Result<bool, StorageError> {
        Ok(self.storage.get(&session_key(peer))?.is_some())
    }

    /// Load the session for `peer`.
    pub fn load(&self, peer: &str) -> Result<Option<RatchetSession>, StorageError> {
        let stored = storage::load::<_, StoredSession>(&self.storage, &session_key(peer))?;
        Ok(stored.map(|StoredSession::V1(state)| RatchetSession::from_state(state, &self.config)))
    }

    /// Store `session` for `peer`, replacing any existing one.
    pub fn save(&self, peer: &str, session: &RatchetSession) -> Result<(), StorageError> {
        let lock = self.locks.get(&peer.to_string());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.persist(peer, session)
    }

    /// Delete the session for `peer` (conversation reset).
    pub fn reset(&self, peer: &str) -> Result<(), StorageError> {
        let lock = self.locks.get(&peer.to_string());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.storage.delete(&session_key(peer))?;

        info!(peer, "session reset");
        Ok(())
    }

    /// Peers with a stored session.
    pub fn peers(&self) -> Result<Vec<String>, StorageError> {
        let mut peers = Vec::new();
        for key in self.storage.list_keys(SESSION_PREFIX)? {
            let encoded = key.strip_prefix(SESSION_PREFIX).unwrap_or(&key);
            let bytes =
                hex::decode(encoded).map_err(|e| StorageError::Serialization(e.to_string()))?;
            let peer =
                String::from_utf8(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
            peers.push(peer);
        }
        Ok(peers)
    }

    /// Encrypt for `peer` and persist the advanced session.
    pub fn encrypt(&self, peer: &str, plaintext: &[u8]) -> Result<RatchetMessage, RatchetError> {
        self.update(peer, |session| {
            let mut session =
                session.ok_or_else(|| RatchetError::NoSession { peer: peer.to_string() })?;
            let message = session.encrypt(&self.primitives, plaintext)?;
            Ok((session, message))
        })
    }

    /// Decrypt from `peer` and persist the advanced session.
    ///
    /// If persisting fails the plaintext is discarded and the session stays
    /// at its previous state.
    pub fn decrypt(&self, peer: &str, message: &RatchetMessage) -> Result<Vec<u8>, RatchetError> {
        self.update(peer, |session| {
            let mut session =
                session.ok_or_else(|| RatchetError::NoSession { peer: peer.to_string() })?;
            let plaintext = session.decrypt(&self.primitives, message)?;
            Ok((session, plaintext))
        })
    }

    /// Run one state transition for `peer` under its lock.
    ///
    /// `transition` receives the stored session (if any) and returns the
    /// session to persist plus a result. Nothing is written if it fails.
    pub fn update<T, E>(
        &self,
        peer: &str,
        transition: impl FnOnce(Option<RatchetSession>) -> Result<(RatchetSession, T), E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let lock = self.locks.get(&peer.to_string());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.load(peer)?;
        let (session, result) = transition(current)?;
        self.persist(peer, &session)?;

        debug!(peer, "session updated");
        Ok(result)
    }

    fn persist(&self, peer: &str, session: &RatchetSession) -> Result<(), StorageError> {
        let stored = StoredSession::V1(session.state().clone());
        storage::store(&self.storage, &session_key(peer), &stored)
    }
}

fn session_key(peer: &str) -> String {
    format!("{SESSION_PREFIX}{}", hex::encode(peer))
}
