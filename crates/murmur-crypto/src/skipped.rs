//! Bounded cache of message keys skipped during out-of-order delivery.
//!
//! Keys are indexed by `(chain, index)` where `chain` identifies the chain
//! the key was derived from (a remote ratchet public key for pairwise
//! sessions, a chain generation for sender keys). Each chain may hold at most
//! `max_skip` cached keys. A key is removed from the cache when it is taken.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{chain::MessageKey, error::CryptoError};

/// Skipped message keys, bounded per chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "Vec<(C, MessageKey)>",
    into = "Vec<(C, MessageKey)>",
    bound(serialize = "C: Ord + Clone + Serialize", deserialize = "C: Ord + Deserialize<'de>")
)]
pub struct SkippedKeys<C: Ord> {
    keys: BTreeMap<(C, u32), MessageKey>,
}

impl<C: Ord> Default for SkippedKeys<C> {
    fn default() -> Self {
        Self { keys: BTreeMap::new() }
    }
}

impl<C: Ord + Clone> SkippedKeys<C> {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the key cached for `(chain, index)`.
    ///
    /// A key can be taken at most once.
    pub fn take(&mut self, chain: &C, index: u32) -> Option<MessageKey> {
        self.keys.remove(&(chain.clone(), index))
    }

    /// Whether a key is cached for `(chain, index)`.
    pub fn contains(&self, chain: &C, index: u32) -> bool {
        self.keys.contains_key(&(chain.clone(), index))
    }

    /// Number of keys cached for `chain`.
    pub fn count_for(&self, chain: &C) -> usize {
        self.keys.range((chain.clone(), 0)..=(chain.clone(), u32::MAX)).count()
    }

    /// Check that `additional` more keys for `chain` stay within `max_skip`.
    pub fn check_capacity(
        &self,
        chain: &C,
        additional: u32,
        max_skip: u32,
    ) -> Result<(), CryptoError> {

        let requested = self.count_for(chain) as u64 + u64::from(additional);
        if requested > u64::from(max_skip) {
            return Err(CryptoError::TooManySkippedKeys { requested, limit: max_skip });
        }
        Ok(())
    }

    /// Cache keys skipped over on `chain`.
    ///
    /// Callers check [`check_capacity`](Self::check_capacity) first.
    pub fn insert_all(&mut self, chain: &C, keys: Vec<MessageKey>) {
        for key in keys {
            self.keys.insert((chain.clone(), key.index()), key);
        }
    }

    /// Drop every key cached for `chain`. Returns how many were dropped.
    pub fn remove_chain(&mut self, chain: &C) -> usize {
        let before = self.keys.len();
        self.keys.retain(|(owner, _), _| owner != chain);
        before - self.keys.len()
    }

    /// Total number of cached keys across all chains.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are cached.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<C: Ord> From<Vec<(C, MessageKey)>> for SkippedKeys<C> {
    fn from(entries: Vec<(C, MessageKey)>) -> Self {
        let keys = entries.into_iter().map(|(chain, key)| ((chain, key.index()), key)).collect();
        Self { keys }
    }
}

impl<C: Ord> From<SkippedKeys<C>> for Vec<(C, MessageKey)> {
    fn from(cache: SkippedKeys<C>) -> Self {
        cache.keys.into_iter().map(|((chain, _), key)| (chain, key)).collect()
    }
}
