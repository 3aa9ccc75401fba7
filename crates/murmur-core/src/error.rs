//! Error types for the Murmur core.
//!
//! One strongly-typed error per component. Every error classifies itself:
//!
//! - **fatal**: protocol violations (bad signature, authentication failure,
//!   too many skipped messages). Never retried, and never detailed: every
//!   decryption failure is the same opaque `DecryptionFailed`.
//! - **transient**: infrastructure failures (storage unavailable, bundle not
//!   found, chain seed not yet received). Safe to retry.
//! - **benign race**: expected under concurrency (one-time prekey already
//!   consumed). Handled by starting a fresh handshake.

use murmur_crypto::CryptoError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from the identity and prekey store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    /// No identity has been generated on this installation
    #[error("no identity key pair")]
    NoIdentity,

    /// Secure storage could not be read or written
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    /// Key generation or signing failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl KeyStoreError {
    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StorageUnavailable(err) => err.is_transient(),
            Self::NoIdentity | Self::Crypto(_) => false,
        }
    }
}

/// Errors from the X3DH handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Signed prekey signature does not verify against the bundle identity
    #[error("invalid signed prekey signature")]
    InvalidSignature,

    /// A key agreement produced a non-contributory (all-zero) output
    #[error("invalid key agreement")]
    InvalidKeyAgreement,

    /// The referenced one-time prekey was already used by another handshake
    #[error("one-time prekey {id} already consumed")]
    PreKeyAlreadyConsumed {
        /// One-time prekey id from the handshake message
        id: u32,
    },

    /// The referenced signed prekey is no longer retained
    #[error("unknown signed prekey {id}")]
    UnknownSignedPreKey {
        /// Signed prekey id from the handshake message
        id: u32,
    },

    /// Local key store failure
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Primitive failure other than key agreement
    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl HandshakeError {
    /// Returns true if this error indicates tampering or a broken peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidSignature | Self::InvalidKeyAgreement)
    }

    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::KeyStore(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the session must simply be re-established.
    ///
    /// Expected when two initiators raced for the same one-time prekey, or a
    /// handshake arrived after its signed prekey was purged.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::PreKeyAlreadyConsumed { .. } | Self::UnknownSignedPreKey { .. })
    }
}

impl From<CryptoError> for HandshakeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature => Self::InvalidSignature,
            CryptoError::NonContributoryKeyAgreement => Self::InvalidKeyAgreement,
            other => Self::Crypto(other),
        }
    }
}

/// Errors from a pairwise ratchet session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// Ciphertext, tag or key lookup failed. Deliberately carries no detail.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Catching up would cache more skipped message keys than allowed
    #[error("too many skipped messages")]
    TooManySkippedMessages,

    /// No session exists for this peer
    #[error("no session with {peer}")]
    NoSession {
        /// Peer identifier
        peer: String,
    },

    /// A responder session cannot send before the first inbound message
    #[error("no remote ratchet key yet")]
    NotReady,

    /// Session state could not be persisted or loaded
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Primitive failure while encrypting (entropy, chain exhaustion)
    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl RatchetError {
    /// Returns true if this error indicates tampering or a broken session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DecryptionFailed | Self::TooManySkippedMessages)
    }

    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Errors from the sender-key group ratchet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupRatchetError {
    /// No chain seed for this sender has been received yet
    #[error("missing chain seed for sender {sender} in group {group} epoch {epoch}")]
    MissingChainSeed {
        /// Group identifier
        group: String,
        /// Epoch of the message
        epoch: u64,
        /// Sender identifier
        sender: String,
    },

    /// Message or seed belongs to an epoch older than the current one
    #[error("stale epoch: current {current}, received {received}")]
    StaleEpoch {
        /// Current epoch of the group
        current: u64,
        /// Epoch carried by the message or seed
        received: u64,
    },

    /// Message or seed belongs to a sender chain replaced by soft rotation
    #[error("stale chain: current generation {current}, received {received}")]
    StaleChain {
        /// Current chain generation for the sender
        current: u32,
        /// Generation carried by the message or seed
        received: u32,
    },

    /// Ciphertext, signature or key lookup failed. Carries no detail.
    #[error("decryption failed")]
    DecryptionFailed,

    /// The stored chain for this sender id was installed from a peer, so it
    /// cannot be used to send
    #[error("chain for sender {sender} is not ours")]
    ForeignChain {
        /// Sender identifier
        sender: String,
    },

    /// Catching up would cache more skipped message keys than allowed
    #[error("too many skipped messages")]
    TooManySkippedMessages,

    /// Chain state could not be persisted or loaded
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Primitive failure while encrypting
    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl GroupRatchetError {
    /// Returns true if this error indicates tampering or a broken chain.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DecryptionFailed | Self::TooManySkippedMessages)
    }

    /// Returns true if this error may resolve on retry.
    ///
    /// A missing chain seed resolves once the sender's distribution message
    /// arrives; callers should request it over the pairwise channel.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::MissingChainSeed { .. } => true,
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Errors from the mapping vault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Ciphertext, tag or key lookup failed. Deliberately carries no detail.
    #[error("decryption failed")]
    DecryptionFailed,

    /// The record decrypted but belongs to a different owner
    #[error("record owner mismatch")]
    OwnerMismatch,

    /// The owner has no stored record
    #[error("no record for owner {owner}")]
    NoRecord {
        /// Owner identifier
        owner: String,
    },

    /// Keys or records could not be persisted or loaded
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Primitive failure while encrypting
    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl VaultError {
    /// Returns true if this error indicates tampering or corruption.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DecryptionFailed | Self::OwnerMismatch)
    }

    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Errors from the key-distribution collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    /// No bundle is published for this peer (or it expired)
    #[error("no prekey bundle for {peer}")]
    NotFound {
        /// Peer identifier
        peer: String,
    },

    /// The service could not be reached
    #[error("key distribution unavailable: {0}")]
    Unavailable(String),
}

impl DistributionError {
    /// Both kinds are retryable conditions, never protocol errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Unavailable(_) => true,
        }
    }
}

/// Errors from encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input shorter than the fixed prefix
    #[error("message truncated")]
    Truncated,

    /// Input larger than the accepted maximum
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Input size
        size: usize,
        /// Accepted maximum
        max: usize,
    },

    /// Version byte not understood by this build
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// Kind byte not understood by this build
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR body malformed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}

/// Errors from the [`Messenger`](crate::messenger::Messenger) facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessengerError {
    /// Key store failure
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Handshake failure
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Pairwise session failure
    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    /// Group ratchet failure
    #[error(transparent)]
    Group(#[from] GroupRatchetError),

    /// Key distribution failure
    #[error(transparent)]
    Distribution(#[from] DistributionError),

    /// Storage failure outside a component
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Malformed inbound message or envelope
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The peer's identity key differs from the trusted one
    #[error("identity key of {peer} changed")]
    IdentityChanged {
        /// Peer identifier
        peer: String,
    },

    /// Both sides initiated at once and our handshake won; the peer will
    /// switch to our session when it sees it
    #[error("handshake from {peer} lost to ours")]
    HandshakeSuperseded {
        /// Peer identifier
        peer: String,
    },

    /// The handshake already created an earlier session with this peer
    #[error("replayed handshake from {peer}")]
    HandshakeReplayed {
        /// Peer identifier
        peer: String,
    },

    /// A sender-key payload names a member other than the pairwise peer
    #[error("{peer} sent sender-key traffic for {claimed}")]
    UnexpectedSender {
        /// Pairwise peer the payload came from
        peer: String,
        /// Member named in the payload
        claimed: String,
    },
}

impl MessengerError {
    /// Returns true if this error indicates tampering or a broken session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Handshake(err) => err.is_fatal(),
            Self::Ratchet(err) => err.is_fatal(),
            Self::Group(err) => err.is_fatal(),
            Self::KeyStore(_)
            | Self::Distribution(_)
            | Self::Storage(_)
            | Self::HandshakeSuperseded { .. } => false,
            Self::Wire(_)
            | Self::IdentityChanged { .. }
            | Self::HandshakeReplayed { .. }
            | Self::UnexpectedSender { .. } => true,
        }
    }

    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::KeyStore(err) => err.is_transient(),
            Self::Handshake(err) => err.is_transient(),
            Self::Ratchet(err) => err.is_transient(),
            Self::Group(err) => err.is_transient(),
            Self::Distribution(err) => err.is_transient(),
            Self::Storage(err) => err.is_transient(),
            Self::Wire(_)
            | Self::IdentityChanged { .. }
            | Self::HandshakeSuperseded { .. }
            | Self::HandshakeReplayed { .. }
            | Self::UnexpectedSender { .. } => false,
        }
    }

    /// Returns true if the caller should fall back to a fresh handshake.
    pub fn is_benign_race(&self) -> bool {
        match self {
            Self::Handshake(err) => err.is_benign_race(),
            Self::HandshakeSuperseded { .. } => true,
            _ => false,
        }
    }
}
