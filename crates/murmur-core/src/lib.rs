//! Murmur end-to-end encryption core.
//!
//! Protocol logic for one-to-one and group messaging plus an independent
//! record vault. Primitive math (X25519, Ed25519, AEAD, HKDF) comes from
//! [`murmur_crypto`]; everything here is built on top of it.
//!
//! # Components
//!
//! - [`KeyStore`]: identity key pair, signed prekey, one-time prekey pool
//!   with atomic claim
//! - [`handshake`]: X3DH initiator and responder
//! - [`RatchetSession`] / [`SessionStore`]: Double Ratchet sessions,
//!   persisted per peer and serialized by a per-peer lock
//! - [`GroupRatchet`]: sender-key chains per `(group, epoch, sender)`, with
//!   hard (epoch) and soft (generation) rotation
//! - [`MappingVault`]: per-owner record encryption with crash-safe key
//!   rotation
//! - [`TrustStore`] / [`SafetyNumber`]: identity pinning and verification
//! - [`Messenger`]: device-level facade over all of the above
//!
//! # Collaborators
//!
//! ```text
//!                  ┌────────────────────────────┐
//!   transport ◀───▶│         Messenger          │◀───▶ KeyDistribution
//!   (caller)       │  sessions · groups · trust │      (async: bundles)
//!                  └─────────────┬──────────────┘
//!                                │ sync
//!                  ┌─────────────▼──────────────┐
//!                  │       SecureStorage        │
//!                  │ (memory · chaotic · redb)  │
//!                  └────────────────────────────┘
//! ```
//!
//! Every state transition is synchronous and persisted before it returns.
//! A failed persist discards the transition.

#![forbid(unsafe_code)]

pub mod config;
pub mod distribution;
pub mod env;
pub mod error;
pub mod fingerprint;
pub mod group;
pub mod handshake;
pub mod keystore;
mod locks;
pub mod messenger;
pub mod ratchet;
pub mod session_store;
pub mod storage;
pub mod trust;
pub mod vault;
pub mod wire;

pub use config::CoreConfig;
pub use distribution::{KeyDistribution, MemoryDirectory};
pub use env::{Environment, ManualClock, SystemEnv};
pub use error::{
    DistributionError, GroupRatchetError, HandshakeError, KeyStoreError, MessengerError,
    RatchetError, VaultError, WireError,
};
pub use fingerprint::SafetyNumber;
pub use group::{GroupMessage, GroupRatchet, SenderKeyDistribution};
pub use handshake::{HandshakeMessage, HandshakeOutput};
pub use keystore::{IdentityKey, IdentityKeyPair, KeyStore, PreKeyBundle};
pub use messenger::{Incoming, Messenger, Outbound};
pub use ratchet::{MessageHeader, RatchetMessage, RatchetSession};
pub use session_store::SessionStore;
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, SecureStorage, StorageError, WriteOp};
pub use trust::{IdentityChange, TrustStore};
pub use vault::{AlgorithmId, EncryptedRecord, MappingVault, RecordVersion};
pub use wire::{PairwisePayload, WireMessage};
