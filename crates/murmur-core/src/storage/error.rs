//! Storage error types.
//!
//! Defines errors that can occur during storage operations:
//! - `Serialization`: Failed to encode/decode persisted state
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, keychain)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if the operation may succeed on retry.
    ///
    /// I/O failures are transient. A value that fails to decode will fail the
    /// same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
