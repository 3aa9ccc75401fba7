//! CLI error types.

use murmur_core::{KeyStoreError, StorageError, VaultError};
use murmur_crypto::CryptoError;
use thiserror::Error;

/// Errors from local store commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// The store could not be opened or read
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Identity or prekey operation failed
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Mapping vault operation failed
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// A command needs an identity that `init` has not created yet
    #[error("no identity in this store, run `murmur init` first")]
    NotInitialized,

    /// Argument is not valid hex
    #[error("invalid hex for {field}: {reason}")]
    InvalidHex {
        /// Argument name
        field: &'static str,
        /// Decoder message
        reason: String,
    },

    /// Primitive failure, such as an unavailable entropy source
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Peer identity key is malformed
    #[error("invalid identity key: {0}")]
    InvalidIdentity(CryptoError),

    /// The peer key differs from the one trusted earlier
    #[error("identity key of {peer} changed; verify it and run `murmur trust`")]
    IdentityChanged {
        /// Peer identifier
        peer: String,
    },
}
