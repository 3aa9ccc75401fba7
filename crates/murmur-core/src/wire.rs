//! Wire format.
//!
//! Every encoded message is `version (1) ‖ kind (1) ‖ CBOR body`. Two
//! layers use it:
//!
//! - [`WireMessage`]: what travels between devices, a pairwise ratchet
//!   message or a group message.
//! - [`PairwisePayload`]: the plaintext inside a pairwise message, which is
//!   either application data or sender-key control traffic.
//!
//! Decoding checks the size before any CBOR parsing and rejects unknown
//! versions and kinds instead of guessing.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::WireError,
    group::{GroupMessage, SenderKeyDistribution},
    ratchet::RatchetMessage,
};

/// Current wire version.
pub const WIRE_VERSION: u8 = 1;

/// Largest accepted encoded message (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

const KIND_PAIRWISE: u8 = 0x01;
const KIND_GROUP: u8 = 0x02;
const KIND_ENVELOPE: u8 = 0x10;

/// A message between devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// One-to-one ratchet message
    Pairwise(RatchetMessage),
    /// Sender-key group message
    Group(GroupMessage),
}

impl WireMessage {
    /// Encode for transport.
    ///
    /// # Errors
    ///
    /// - `WireError::CborEncode` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Pairwise(message) => frame(KIND_PAIRWISE, message),
            Self::Group(message) => frame(KIND_GROUP, message),
        }
    }

    /// Decode a received message.
    ///
    /// # Errors
    ///
    /// - `WireError::TooLarge` if `bytes` exceed [`MAX_MESSAGE_SIZE`]
    /// - `WireError::Truncated`, `UnsupportedVersion` or `UnknownKind` for a
    ///   bad prefix
    /// - `WireError::CborDecode` if the body is malformed
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (kind, body) = unframe(bytes)?;
        match kind {
            KIND_PAIRWISE => Ok(Self::Pairwise(cbor(body)?)),
            KIND_GROUP => Ok(Self::Group(cbor(body)?)),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Plaintext of a pairwise message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairwisePayload {
    /// Application data
    Application(Vec<u8>),
    /// A member's sender chain for a group
    SenderKeyDistribution(SenderKeyDistribution),
    /// Ask a member to (re)send its sender chain
    SenderKeyRequest {
        /// Group identifier
        group_id: String,
        /// Epoch the chain is needed for
        epoch: u64,
        /// Whose chain is needed
        sender_id: String,
    },
}

impl PairwisePayload {
    /// Encode as ratchet plaintext.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        frame(KIND_ENVELOPE, self)
    }

    /// Decode decrypted ratchet plaintext.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (kind, body) = unframe(bytes)?;
        if kind != KIND_ENVELOPE {
            return Err(WireError::UnknownKind(kind));
        }
        cbor(body)
    }
}

fn frame<T: Serialize>(kind: u8, body: &T) -> Result<Vec<u8>, WireError> {
    let mut bytes = vec![WIRE_VERSION, kind];
    ciborium::ser::into_writer(body, &mut bytes).map_err(|e| WireError::CborEncode(e.to_string()))?;
    Ok(bytes)
}

fn unframe(bytes: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
    }
    let [version, kind, body @ ..] = bytes else {
        return Err(WireError::Truncated);
    };
    if *version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(*version));
    }
    Ok((*kind, body))
}

fn cbor<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(body).map_err(|e| WireError::CborDecode(e.to_string()))
}
