//! Double Ratchet session.
//!
//! A [`RatchetSession`] encrypts and decrypts pairwise messages after a
//! handshake. Three chains interact:
//!
//! ```text
//!   root key ──DH step──▶ root key ──DH step──▶ ...
//!        │                    │
//!        ▼                    ▼
//!   sending chain        receiving chain
//!   (symmetric steps     (symmetric steps,
//!    per message)         skipped keys cached)
//! ```
//!
//! A DH step happens when a header carries a ratchet key we have not seen.
//! The sending chain is then dropped and recreated lazily from a fresh key
//! pair on the next encrypt.
//!
//! Both [`encrypt`](RatchetSession::encrypt) and
//! [`decrypt`](RatchetSession::decrypt) are transactional: they work on a
//! copy of the state and commit only on success, so a rejected message
//! (forged, replayed, over the skip bound) leaves the session untouched.

use murmur_crypto::{
    ChainKey, CryptoError, CryptoPrimitives, DhKeyPair, PublicKey, SharedSecret, SkippedKeys,
    SymmetricKey,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::{
    config::CoreConfig,
    error::RatchetError,
    handshake::{HandshakeMessage, HandshakeOutput, RatchetSeed},
    keystore::IdentityKey,
};

/// Current message header version.
pub const RATCHET_VERSION: u8 = 1;

/// HKDF info label for root chain steps.
const ROOT_INFO: &[u8] = b"MurmurRatchetRoot";

/// Base keys of replaced sessions remembered per peer.
pub const ANSWERED_HANDSHAKE_HISTORY: usize = 64;

/// Authenticated, unencrypted message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Header format version
    pub version: u8,
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Index of this message in the sending chain
    pub message_number: u32,
}

impl MessageHeader {
    /// Encoded header length.
    pub const ENCODED_LEN: usize = 1 + 32 + 4 + 4;

    /// `version ‖ ratchet_key ‖ previous_chain_length (BE) ‖ message_number (BE)`.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[0] = self.version;
        bytes[1..33].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[33..37].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[37..41].copy_from_slice(&self.message_number.to_be_bytes());
        bytes
    }
}

/// One encrypted pairwise message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Header, authenticated as associated data
    pub header: MessageHeader,
    /// `nonce ‖ ciphertext ‖ tag`
    pub ciphertext: Vec<u8>,
    /// Attached until the peer has answered, so they can build the session
    pub handshake: Option<HandshakeMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ReceivingChain {
    ratchet_key: PublicKey,
    chain: ChainKey,
}

/// Complete persisted state of one pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    remote_identity: IdentityKey,
    remote_registration_id: u32,
    associated_data: Vec<u8>,
    root_key: SymmetricKey,
    local_ratchet: Option<DhKeyPair>,
    remote_ratchet: Option<PublicKey>,
    sending: Option<ChainKey>,
    previous_sending_length: u32,
    /// Oldest first
    receiving: Vec<ReceivingChain>,
    skipped: SkippedKeys<PublicKey>,
    pending_handshake: Option<HandshakeMessage>,
    /// Ephemeral key of the handshake that created this session (responder)
    handshake_ephemeral: Option<PublicKey>,
    /// Handshake ephemeral keys of the sessions this one replaced, oldest first
    #[serde(default)]
    replaced_handshakes: Vec<PublicKey>,
}

/// A pairwise Double Ratchet session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetSession {
    state: SessionState,
    max_skip: u32,
    max_receiving_chains: usize,
}

impl RatchetSession {
    /// Build a session from a completed handshake.
    ///
    /// The initiator passes the handshake message so it is attached to every
    /// outbound message until the first reply decrypts.
    pub fn new(
        output: HandshakeOutput,
        handshake: Option<HandshakeMessage>,
        config: &CoreConfig,
    ) -> Self {
        let (local_ratchet, remote_ratchet) = match output.seed {
            RatchetSeed::Initiator { remote_ratchet_key } => (None, Some(remote_ratchet_key)),
            RatchetSeed::Responder { local_ratchet } => (Some(local_ratchet), None),
        };

        let state = SessionState {
            remote_identity: output.remote_identity,
            remote_registration_id: output.remote_registration_id,
            associated_data: output.associated_data,
            root_key: output.root_key,
            local_ratchet,
            remote_ratchet,
            sending: None,
            previous_sending_length: 0,
            receiving: Vec::new(),
            skipped: SkippedKeys::new(),
            pending_handshake: handshake,
            handshake_ephemeral: None,
            replaced_handshakes: Vec::new(),
        };
        Self::from_state(state, config)
    }

    /// Build a responder session and remember the handshake that created it.
    pub fn from_handshake(
        output: HandshakeOutput,
        handshake: &HandshakeMessage,
        config: &CoreConfig,
    ) -> Self {
        let mut session = Self::new(output, None, config);
        session.state.handshake_ephemeral = Some(handshake.ephemeral_key);
        session
    }

    /// Resume a persisted session.
    pub fn from_state(state: SessionState, config: &CoreConfig) -> Self {
        Self {
            state,
            max_skip: config.max_skip,
            max_receiving_chains: config.max_receiving_chains.max(1),
        }
    }

    /// State to persist.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Peer identity bound into this session.
    pub fn remote_identity(&self) -> IdentityKey {
        self.state.remote_identity
    }

    /// Peer registration id.
    pub fn remote_registration_id(&self) -> u32 {
        self.state.remote_registration_id
    }

    /// Whether outbound messages still carry the handshake.
    pub fn has_pending_handshake(&self) -> bool {
        self.state.pending_handshake.is_some()
    }

    /// Handshake still attached to outbound messages, if any.
    pub fn pending_handshake(&self) -> Option<&HandshakeMessage> {
        self.state.pending_handshake.as_ref()
    }

    /// Whether this session was created by the given handshake.
    pub fn was_created_by(&self, handshake: &HandshakeMessage) -> bool {
        self.state.handshake_ephemeral == Some(handshake.ephemeral_key)
    }

    /// Whether `handshake` created a session that this one replaced.
    ///
    /// Such a handshake is a replay: answering it again would rebuild the
    /// old session and reuse its message keys.
    pub fn answered_earlier(&self, handshake: &HandshakeMessage) -> bool {
        self.state.replaced_handshakes.contains(&handshake.ephemeral_key)
    }

    /// Take over the handshake history of `previous`, which this session
    /// replaces. The newest [`ANSWERED_HANDSHAKE_HISTORY`] keys are kept.
    pub fn succeed(&mut self, previous: &RatchetSession) {
        let mut history = previous.state.replaced_handshakes.clone();
        history.extend(previous.state.handshake_ephemeral);
        let excess = history.len().saturating_sub(ANSWERED_HANDSHAKE_HISTORY);
        history.drain(..excess);
        self.state.replaced_handshakes = history;
    }

    /// Number of cached skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.state.skipped.len()
    }

    /// Encrypt one message.
    pub fn encrypt<P: CryptoPrimitives>(
        &mut self,
        primitives: &P,
        plaintext: &[u8],
    ) -> Result<RatchetMessage, RatchetError> {
        let mut next = self.state.clone();

        if next.sending.is_none() {
            let remote = next.remote_ratchet.ok_or(RatchetError::NotReady)?;
            let key_pair = primitives.generate_dh_key_pair();
            let agreement = primitives.dh(&key_pair.secret, &remote).map_err(RatchetError::Crypto)?;
            let (root_key, chain_key) =
                kdf_root(primitives, &next.root_key, &agreement).map_err(RatchetError::Crypto)?;

            next.root_key = root_key;
            next.sending = Some(ChainKey::new(chain_key, 0));
            next.local_ratchet = Some(key_pair);
            trace!("sending chain created");
        }

        let (Some(sending), Some(local)) = (next.sending.as_mut(), next.local_ratchet.as_ref())
        else {
            return Err(RatchetError::NotReady);
        };
        let message_key = sending.step(primitives).map_err(RatchetError::Crypto)?;

        let header = MessageHeader {
            version: RATCHET_VERSION,
            ratchet_key: local.public,
            previous_chain_length: next.previous_sending_length,
            message_number: message_key.index(),
        };
        let aad = message_aad(&next.associated_data, &header);
        let ciphertext =
            message_key.seal(primitives, plaintext, &aad).map_err(RatchetError::Crypto)?;

        #[cfg(test)]
        key_capture::record(&message_key);

        let handshake = next.pending_handshake.clone();
        self.state = next;

        Ok(RatchetMessage { header, ciphertext, handshake })
    }

    /// Decrypt one message.
    ///
    /// Every authentication or lookup failure is the same
    /// [`RatchetError::DecryptionFailed`]. Only the skip bound is reported
    /// separately.
    pub fn decrypt<P: CryptoPrimitives>(
        &mut self,
        primitives: &P,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, RatchetError> {
        let header = &message.header;
        if header.version != RATCHET_VERSION {
            return Err(RatchetError::DecryptionFailed);
        }

        let mut next = self.state.clone();
        let aad = message_aad(&next.associated_data, header);

        let message_key = match next.skipped.take(&header.ratchet_key, header.message_number) {
            Some(key) => key,
            None => {
                let position = match next
                    .receiving
                    .iter()
                    .position(|chain| chain.ratchet_key == header.ratchet_key)
                {
                    Some(position) => position,
                    None => next.ratchet_step(
                        primitives,
                        header,
                        self.max_skip,
                        self.max_receiving_chains,
                    )?,
                };

                let receiving = &mut next.receiving[position];
                if header.message_number < receiving.chain.index() {
                    // Already consumed, or a replay
                    return Err(RatchetError::DecryptionFailed);
                }

                let gap = header.message_number - receiving.chain.index();
                next.skipped
                    .check_capacity(&receiving.ratchet_key, gap, self.max_skip)
                    .map_err(map_chain_error)?;
                let (skipped, key) = receiving
                    .chain
                    .advance_to(primitives, header.message_number, self.max_skip)
                    .map_err(map_chain_error)?;
                next.skipped.insert_all(&receiving.ratchet_key, skipped);
                key
            },
        };

        let plaintext = message_key
            .open(primitives, &message.ciphertext, &aad)
            .map_err(|_| RatchetError::DecryptionFailed)?;

        if next.pending_handshake.take().is_some() {
            debug!("peer answered, handshake no longer attached");
        }
        self.state = next;

        Ok(plaintext)
    }
}

impl SessionState {
    /// DH ratchet step for a new remote ratchet key.
    ///
    /// Keys left on the current receiving chain up to the header's previous
    /// chain length are cached first. Returns the new receiving chain's
    /// position.
    fn ratchet_step<P: CryptoPrimitives>(
        &mut self,
        primitives: &P,
        header: &MessageHeader,
        max_skip: u32,
        max_receiving_chains: usize,
    ) -> Result<usize, RatchetError> {
        let local = self.local_ratchet.clone().ok_or(RatchetError::DecryptionFailed)?;

        if let Some(current) = self.receiving.last_mut() {
            if header.previous_chain_length > current.chain.index() {
                let gap = header.previous_chain_length - current.chain.index();
                self.skipped
                    .check_capacity(&current.ratchet_key, gap, max_skip)
                    .map_err(map_chain_error)?;
                let (mut skipped, last) = current
                    .chain
                    .advance_to(primitives, header.previous_chain_length - 1, max_skip)
                    .map_err(map_chain_error)?;
                skipped.push(last);
                self.skipped.insert_all(&current.ratchet_key, skipped);
            }
        }

        let agreement = primitives
            .dh(&local.secret, &header.ratchet_key)
            .map_err(|_| RatchetError::DecryptionFailed)?;
        let (root_key, chain_key) =
            kdf_root(primitives, &self.root_key, &agreement).map_err(RatchetError::Crypto)?;

        self.root_key = root_key;
        self.remote_ratchet = Some(header.ratchet_key);
        self.receiving.push(ReceivingChain {
            ratchet_key: header.ratchet_key,
            chain: ChainKey::new(chain_key, 0),
        });
        if let Some(sending) = self.sending.take() {
            self.previous_sending_length = sending.index();
        }

        while self.receiving.len() > max_receiving_chains {
            let evicted = self.receiving.remove(0);
            let dropped = self.skipped.remove_chain(&evicted.ratchet_key);
            debug!(dropped, "oldest receiving chain evicted");
        }

        trace!(chains = self.receiving.len(), "ratchet step");
        Ok(self.receiving.len() - 1)
    }
}

/// `associated_data ‖ header`.
fn message_aad(associated_data: &[u8], header: &MessageHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + MessageHeader::ENCODED_LEN);
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(&header.to_bytes());
    aad
}

/// `root_key' ‖ chain_key = HKDF(DH output ‖ root_key)`.
fn kdf_root<P: CryptoPrimitives>(
    primitives: &P,
    root_key: &SymmetricKey,
    agreement: &SharedSecret,
) -> Result<(SymmetricKey, SymmetricKey), CryptoError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(agreement.as_bytes());
    ikm[32..].copy_from_slice(root_key.as_bytes());

    let mut okm = [0u8; 64];
    let result = primitives.hkdf(None, &ikm, ROOT_INFO, &mut okm);
    ikm.zeroize();
    result?;

    let keys = (SymmetricKey::from_slice(&okm[..32]), SymmetricKey::from_slice(&okm[32..]));
    okm.zeroize();
    Ok((keys.0?, keys.1?))
}

fn map_chain_error(err: CryptoError) -> RatchetError {
    match err {
        CryptoError::TooManySkippedKeys { .. } => RatchetError::TooManySkippedMessages,
        _ => RatchetError::DecryptionFailed,
    }
}

/// Records every message key used for encryption on the current thread, so
/// tests can check that keys never repeat.
#[cfg(test)]
pub(crate) mod key_capture {
    use std::cell::RefCell;

    use murmur_crypto::{MessageKey, SymmetricKey};

    thread_local! {
        static CAPTURED: RefCell<Vec<SymmetricKey>> = const { RefCell::new(Vec::new()) };
    }

    pub(crate) fn record(key: &MessageKey) {
        CAPTURED.with(|captured| captured.borrow_mut().push(key.key().clone()));
    }

    pub(crate) fn take() -> Vec<SymmetricKey> {
        CAPTURED.with(|captured| std::mem::take(&mut *captured.borrow_mut()))
    }
}
