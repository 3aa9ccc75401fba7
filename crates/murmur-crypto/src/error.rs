//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from primitive operations and chain derivation.
///
/// Variants deliberately carry no detail about *why* an authenticated
/// decryption failed. Callers surface a single opaque failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD authentication failed or the ciphertext was malformed
    #[error("authentication failed")]
    AuthenticationFailed,

    /// AEAD encryption failed (plaintext too large for the cipher)
    #[error("encryption failed")]
    EncryptionFailed,

    /// Signature did not verify against the given public key
    #[error("invalid signature")]
    InvalidSignature,

    /// Diffie-Hellman produced an all-zero output (low-order point)
    #[error("non-contributory key agreement")]
    NonContributoryKeyAgreement,

    /// Requested HKDF output length is not supported
    #[error("invalid HKDF output length: {requested}")]
    InvalidOutputLength {
        /// Number of bytes requested
        requested: usize,
    },

    /// Chain position requested is behind the chain's current position
    #[error("chain index behind: at {current}, requested {requested}")]
    ChainIndexBehind {
        /// Current chain index
        current: u32,
        /// Requested index
        requested: u32,
    },

    /// Catching up would skip more message keys than allowed
    #[error("too many skipped message keys: {requested} (limit {limit})")]
    TooManySkippedKeys {
        /// Number of keys that would be held
        requested: u64,
        /// Configured limit
        limit: u32,
    },

    /// Chain index would overflow
    #[error("chain exhausted at index {index}")]
    ChainExhausted {
        /// Index at which the overflow was detected
        index: u32,
    },

    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// OS entropy source failed
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

impl CryptoError {
    /// Returns true if this error indicates tampering or a protocol violation.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::AuthenticationFailed
            | Self::InvalidSignature
            | Self::NonContributoryKeyAgreement
            | Self::TooManySkippedKeys { .. }
            | Self::ChainExhausted { .. }
            | Self::InvalidKeyLength { .. } => true,

            Self::EncryptionFailed
            | Self::InvalidOutputLength { .. }
            | Self::ChainIndexBehind { .. }
            | Self::Entropy(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_is_fatal() {
        assert!(CryptoError::AuthenticationFailed.is_fatal());
        assert!(CryptoError::TooManySkippedKeys { requested: 1001, limit: 1000 }.is_fatal());
    }

    #[test]
    fn entropy_failure_is_not_fatal() {
        assert!(!CryptoError::Entropy("unavailable".to_string()).is_fatal());
    }

    #[test]
    fn authentication_failure_display_is_opaque() {
        assert_eq!(CryptoError::AuthenticationFailed.to_string(), "authentication failed");
    }
}
