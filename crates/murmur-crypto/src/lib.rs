//! Murmur Cryptographic Primitives
//!
//! Cryptographic building blocks for the Murmur messaging core. Protocol
//! logic (handshakes, ratchets, vault) lives in `murmur-core`; this crate
//! provides the primitive capability it calls as a black box and the one
//! symmetric construction shared by every ratchet.
//!
//! # Key Lifecycle
//!
//! ```text
//! X3DH shared secret / sender chain seed
//!        │
//!        ▼
//! HKDF → Root Key → Chain Key (per ratchet step, per sender)
//!        │
//!        ▼
//! Chain Ratchet → Message Keys
//!        │
//!        ▼
//! AEAD Encryption → nonce ‖ ciphertext ‖ tag
//! ```
//!
//! Message keys are used for exactly one encryption or decryption and are
//! zeroized when dropped. Keys skipped over during out-of-order delivery are
//! held in a [`SkippedKeys`] cache bounded per chain.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain advancement: old chain keys are zeroized after deriving the next key
//! - Message key disposal: keys are zeroized immediately after single use
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD with caller-supplied associated data
//! - Failed authentication tag yields one opaque error
//!
//! Determinism:
//! - [`RustCryptoPrimitives::from_seed`] makes every generated key
//!   reproducible, which the test suites rely on

#![forbid(unsafe_code)]

pub mod chain;
pub mod error;
pub mod keys;
pub mod primitives;
pub mod skipped;

pub use chain::{ChainKey, MessageKey};
pub use error::CryptoError;
pub use keys::{
    DhKeyPair, KEY_SIZE, PublicKey, SIGNATURE_SIZE, SecretKey, SharedSecret, Signature,
    SigningKeyPair, SigningPublicKey, SymmetricKey,
};
pub use primitives::{CryptoPrimitives, NONCE_SIZE, RustCryptoPrimitives, TAG_SIZE};
pub use skipped::SkippedKeys;
