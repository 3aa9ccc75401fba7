//! Symmetric chain ratchet for forward-secure message key derivation
//!
//! # Security Properties
//!
//! - Forward Secrecy: Old chain keys are overwritten when advancing
//! - Key Uniqueness: Each index produces a unique message key
//! - Determinism: Same chain key always produces same key sequence
//!
//! The message key for index `n` is derived from the chain key at `n` *before*
//! the chain advances, so one chain key never protects two messages.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    keys::{KEY_SIZE, SymmetricKey},
    primitives::{CryptoPrimitives, NONCE_SIZE, TAG_SIZE},
};

/// HKDF info label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// HKDF info label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// A message key derived from a chain.
///
/// Used for exactly one encryption or decryption and then dropped, which
/// zeroizes it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    key: SymmetricKey,
    index: u32,
}

impl MessageKey {
    /// 32-byte AEAD key.
    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Chain index this key was derived at.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Encrypt under this key with a fresh random nonce.
    ///
    /// Output layout: `nonce (24) ‖ ciphertext ‖ tag (16)`.
    pub fn seal<P: CryptoPrimitives>(
        &self,
        primitives: &P,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = primitives.random_nonce();
        let ciphertext = primitives.aead_encrypt(&self.key, &nonce, plaintext, associated_data)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a buffer produced by [`seal`](Self::seal).
    ///
    /// Truncated input and tag mismatch both yield
    /// [`CryptoError::AuthenticationFailed`].
    pub fn open<P: CryptoPrimitives>(
        &self,
        primitives: &P,
        sealed: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        primitives.aead_decrypt(&self.key, &nonce_bytes, ciphertext, associated_data)
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Forward-secure chain key.
///
/// Each [`step()`](Self::step) call:
/// 1. Derives a message key from the current chain key
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key (forward secrecy)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    key: SymmetricKey,
    index: u32,
}

impl ChainKey {
    /// Start a chain from a seed at the given index.
    pub fn new(key: SymmetricKey, index: u32) -> Self {
        Self { key, index }
    }

    /// Index of the next message key this chain will produce.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Current chain key bytes.
    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Message key at the current index, without advancing.
    pub fn message_key<P: CryptoPrimitives>(
        &self,
        primitives: &P,
    ) -> Result<MessageKey, CryptoError> {

        let key = self.derive(primitives, MESSAGE_LABEL)?;
        Ok(MessageKey { key, index: self.index })
    }

    /// The chain key at the next index.
    pub fn next<P: CryptoPrimitives>(&self, primitives: &P) -> Result<Self, CryptoError> {
        if self.index == u32::MAX {
            return Err(CryptoError::ChainExhausted { index: self.index });
        }

        let key = self.derive(primitives, CHAIN_LABEL)?;
        Ok(Self { key, index: self.index + 1 })
    }

    /// Derive the current message key and advance the chain by one.
    pub fn step<P: CryptoPrimitives>(&mut self, primitives: &P) -> Result<MessageKey, CryptoError> {
        let message_key = self.message_key(primitives)?;
        let next = self.next(primitives)?;

        // Dropping the previous value zeroizes the old chain key
        *self = next;

        Ok(message_key)
    }

    /// Advance the chain to `target`, returning every message key skipped
    /// over and the message key at `target`.
    ///
    /// On success the chain is positioned at `target + 1`. On error the chain
    /// is unchanged.
    pub fn advance_to<P: CryptoPrimitives>(
        &mut self,
        primitives: &P,
        target: u32,
        max_skip: u32,
    ) -> Result<(Vec<MessageKey>, MessageKey), CryptoError> {
        if target < self.index {
            return Err(CryptoError::ChainIndexBehind { current: self.index, requested: target });
        }

        let skip_count = target - self.index;
        if skip_count > max_skip {
            return Err(CryptoError::TooManySkippedKeys {
                requested: u64::from(skip_count),
                limit: max_skip,
            });
        }

        let mut chain = self.clone();
        let mut skipped = Vec::with_capacity(skip_count as usize);
        while chain.index < target {
            skipped.push(chain.step(primitives)?);
        }
        let message_key = chain.step(primitives)?;

        *self = chain;
        Ok((skipped, message_key))
    }

    fn derive<P: CryptoPrimitives>(
        &self,
        primitives: &P,
        label: &[u8],
    ) -> Result<SymmetricKey, CryptoError> {
        let mut info = Vec::with_capacity(label.len() + 4);
        info.extend_from_slice(label);
        info.extend_from_slice(&self.index.to_be_bytes());

        let mut output = [0u8; KEY_SIZE];
        primitives.hkdf(None, self.key.as_bytes(), &info, &mut output)?;
        let key = SymmetricKey::from_bytes(output);
        output.zeroize();

        Ok(key)
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey").field("index", &self.index).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::RustCryptoPrimitives;

    fn primitives() -> RustCryptoPrimitives {
        RustCryptoPrimitives::from_seed([9u8; 32])
    }

    fn test_chain() -> ChainKey {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ChainKey::new(SymmetricKey::from_bytes(seed), 0)
    }

    #[test]
    fn step_increments_index() {
        let p = primitives();
        let mut chain = test_chain();

        let key0 = chain.step(&p).unwrap();
        assert_eq!(key0.index(), 0);
        assert_eq!(chain.index(), 1);

        let key1 = chain.step(&p).unwrap();
        assert_eq!(key1.index(), 1);
        assert_eq!(chain.index(), 2);
    }

    #[test]
    fn step_produces_unique_keys() {
        let p = primitives();
        let mut chain = test_chain();

        let key0 = chain.step(&p).unwrap();
        let key1 = chain.step(&p).unwrap();
        let key2 = chain.step(&p).unwrap();

        assert_ne!(key0.key(), key1.key(), "keys must be unique");
        assert_ne!(key1.key(), key2.key(), "keys must be unique");
        assert_ne!(key0.key(), key2.key(), "keys must be unique");
    }

    #[test]
    fn message_key_differs_from_next_chain_key() {
        let p = primitives();
        let chain = test_chain();

        let message_key = chain.message_key(&p).unwrap();
        let next = chain.next(&p).unwrap();

        assert_ne!(message_key.key(), next.key());
    }

    #[test]
    fn chain_is_deterministic() {
        let p = primitives();
        let mut chain1 = test_chain();
        let mut chain2 = test_chain();

        for _ in 0..10 {
            assert_eq!(chain1.step(&p).unwrap(), chain2.step(&p).unwrap());
        }
    }

    #[test]
    fn advance_to_matches_sequential_steps() {
        let p = primitives();

        let mut sequential = test_chain();
        let mut keys = Vec::new();
        for _ in 0..6 {
            keys.push(sequential.step(&p).unwrap());
        }

        let mut skipping = test_chain();
        let (skipped, target) = skipping.advance_to(&p, 5, 1000).unwrap();

        assert_eq!(skipped.len(), 5);
        assert_eq!(&skipped[..], &keys[..5]);
        assert_eq!(target, keys[5]);
        assert_eq!(skipping.index(), 6);
    }

    #[test]
    fn advance_to_current_index_skips_nothing() {
        let p = primitives();
        let mut chain = test_chain();

        let (skipped, key) = chain.advance_to(&p, 0, 1000).unwrap();
        assert!(skipped.is_empty());
        assert_eq!(key.index(), 0);
    }

    #[test]
    fn advance_to_rejects_past_index() {
        let p = primitives();
        let mut chain = test_chain();
        chain.advance_to(&p, 5, 1000).unwrap();

        let result = chain.advance_to(&p, 3, 1000);
        assert_eq!(result.unwrap_err(), CryptoError::ChainIndexBehind { current: 6, requested: 3 });
    }

    #[test]
    fn advance_to_rejects_too_far_ahead_without_mutation() {
        let p = primitives();
        let mut chain = test_chain();

        let result = chain.advance_to(&p, 1001, 1000);
        assert!(matches!(result, Err(CryptoError::TooManySkippedKeys { limit: 1000, .. })));
        assert_eq!(chain, test_chain());
    }

    #[test]
    fn exhausted_chain_refuses_to_step() {
        let p = primitives();
        let mut chain = ChainKey::new(SymmetricKey::from_bytes([1u8; 32]), u32::MAX);

        assert_eq!(chain.step(&p).unwrap_err(), CryptoError::ChainExhausted { index: u32::MAX });
    }

    #[test]
    fn seal_open_roundtrip() {
        let p = primitives();
        let key = test_chain().message_key(&p).unwrap();

        let sealed = key.seal(&p, b"hello", b"header").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 5 + TAG_SIZE);
        assert_eq!(key.open(&p, &sealed, b"header").unwrap(), b"hello");
    }

    #[test]
    fn open_rejects_truncated_input() {
        let p = primitives();
        let key = test_chain().message_key(&p).unwrap();

        let result = key.open(&p, &[0u8; NONCE_SIZE + TAG_SIZE - 1], b"");
        assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn open_rejects_tampered_nonce() {
        let p = primitives();
        let key = test_chain().message_key(&p).unwrap();

        let mut sealed = key.seal(&p, b"hello", b"").unwrap();
        sealed[0] ^= 0x01;

        assert_eq!(key.open(&p, &sealed, b"").unwrap_err(), CryptoError::AuthenticationFailed);
    }
}
