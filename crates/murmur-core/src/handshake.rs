//! X3DH handshake.
//!
//! Establishes a shared secret between two identities, one of which may be
//! offline, from the responder's published [`PreKeyBundle`].
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)          only when a one-time prekey was used
//!
//! IKM = 0xFF * 32 ‖ DH1 ‖ DH2 ‖ DH3 [‖ DH4]
//! shared_secret ‖ root_key = HKDF(salt = 0 * 32, IKM, info)
//! AD = IK_A.dh ‖ IK_A.signing ‖ IK_B.dh ‖ IK_B.signing
//! ```
//!
//! Both parties compute byte-identical outputs. The responder's signed
//! prekey doubles as its first ratchet key pair.

use murmur_crypto::{CryptoPrimitives, DhKeyPair, PublicKey, SharedSecret, SymmetricKey};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::{
    env::Environment,
    error::{HandshakeError, KeyStoreError},
    keystore::{IdentityKey, IdentityKeyPair, KeyStore, PreKeyBundle},
    storage::SecureStorage,
};

/// HKDF info label for the handshake.
const X3DH_INFO: &[u8] = b"MurmurX3DH";

/// Leading pad that separates X3DH key material from any curve point.
const PAD: [u8; 32] = [0xFF; 32];

/// Sent by the initiator alongside its first messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Initiator's identity
    pub initiator_identity: IdentityKey,
    /// Initiator's registration id
    pub initiator_registration_id: u32,
    /// Ephemeral public key
    pub ephemeral_key: PublicKey,
    /// Responder signed prekey used
    pub signed_pre_key_id: u32,
    /// Responder one-time prekey used, if any
    pub one_time_pre_key_id: Option<u32>,
}

/// How each side seeds its first ratchet step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RatchetSeed {
    /// Initiator: the responder's signed prekey is the first remote ratchet key
    Initiator {
        /// Responder's signed prekey
        remote_ratchet_key: PublicKey,
    },
    /// Responder: the signed prekey pair is the first local ratchet key
    Responder {
        /// Signed prekey pair
        local_ratchet: DhKeyPair,
    },
}

/// Result of a completed handshake on either side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeOutput {
    /// First 32 bytes of the derived secret
    pub shared_secret: SymmetricKey,
    /// Second 32 bytes; seeds the ratchet root chain
    pub root_key: SymmetricKey,
    /// Initiator identity followed by responder identity
    pub associated_data: Vec<u8>,
    /// The other party's identity
    pub remote_identity: IdentityKey,
    /// The other party's registration id
    pub remote_registration_id: u32,
    /// Ratchet initialization for this side
    pub seed: RatchetSeed,
}

/// Run the initiator side against a peer's bundle.
///
/// Verifies the signed prekey signature before any key agreement.
pub fn initiate<P: CryptoPrimitives>(
    primitives: &P,
    local: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(HandshakeOutput, HandshakeMessage), HandshakeError> {
    bundle.verify(primitives)?;

    let ephemeral = primitives.generate_dh_key_pair();

    let mut agreements = vec![
        primitives.dh(&local.dh.secret, &bundle.signed_pre_key)?,
        primitives.dh(&ephemeral.secret, &bundle.identity_key.dh)?,
        primitives.dh(&ephemeral.secret, &bundle.signed_pre_key)?,
    ];
    if let Some(one_time) = &bundle.one_time_pre_key {
        agreements.push(primitives.dh(&ephemeral.secret, &one_time.public)?);
    }

    let (shared_secret, root_key) = derive(primitives, &agreements)?;
    let associated_data = associated_data(&local.public(), &bundle.identity_key);

    let message = HandshakeMessage {
        initiator_identity: local.public(),
        initiator_registration_id: local.registration_id,
        ephemeral_key: ephemeral.public,
        signed_pre_key_id: bundle.signed_pre_key_id,
        one_time_pre_key_id: bundle.one_time_pre_key.map(|key| key.id),
    };

    debug!(
        signed_pre_key_id = bundle.signed_pre_key_id,
        one_time = bundle.one_time_pre_key.is_some(),
        "handshake initiated"
    );

    let output = HandshakeOutput {
        shared_secret,
        root_key,
        associated_data,
        remote_identity: bundle.identity_key,
        remote_registration_id: bundle.registration_id,
        seed: RatchetSeed::Initiator { remote_ratchet_key: bundle.signed_pre_key },
    };
    Ok((output, message))
}

/// Run the responder side for a received handshake.
///
/// The referenced one-time prekey is claimed only after the key agreement
/// succeeds. If a concurrent responder claimed it first this fails with
/// [`HandshakeError::PreKeyAlreadyConsumed`].
pub fn respond<S: SecureStorage, P: CryptoPrimitives, E: Environment>(
    keystore: &KeyStore<S, P, E>,
    message: &HandshakeMessage,
) -> Result<HandshakeOutput, HandshakeError> {
    let primitives = keystore.primitives();
    let local = keystore.identity().ok_or(KeyStoreError::NoIdentity)?;

    let signed_pre_key = keystore
        .signed_pre_key_for(message.signed_pre_key_id)
        .ok_or(HandshakeError::UnknownSignedPreKey { id: message.signed_pre_key_id })?;

    let one_time_pre_key = match message.one_time_pre_key_id {
        Some(id) => Some(
            keystore
                .one_time_pre_key(id)
                .ok_or(HandshakeError::PreKeyAlreadyConsumed { id })?,
        ),
        None => None,
    };

    let mut agreements = vec![
        primitives.dh(&signed_pre_key.key_pair.secret, &message.initiator_identity.dh)?,
        primitives.dh(&local.dh.secret, &message.ephemeral_key)?,
        primitives.dh(&signed_pre_key.key_pair.secret, &message.ephemeral_key)?,
    ];
    if let Some(one_time) = &one_time_pre_key {
        agreements.push(primitives.dh(&one_time.key_pair.secret, &message.ephemeral_key)?);
    }

    let (shared_secret, root_key) = derive(primitives, &agreements)?;

    if let Some(one_time) = &one_time_pre_key {
        keystore
            .consume_one_time_pre_key(one_time.id)?
            .ok_or(HandshakeError::PreKeyAlreadyConsumed { id: one_time.id })?;
    }

    debug!(
        signed_pre_key_id = message.signed_pre_key_id,
        one_time = one_time_pre_key.is_some(),
        "handshake answered"
    );

    Ok(HandshakeOutput {
        shared_secret,
        root_key,
        associated_data: associated_data(&message.initiator_identity, &local.public()),
        remote_identity: message.initiator_identity,
        remote_registration_id: message.initiator_registration_id,
        seed: RatchetSeed::Responder { local_ratchet: signed_pre_key.key_pair },
    })
}

/// `initiator.dh ‖ initiator.signing ‖ responder.dh ‖ responder.signing`.
fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(2 * IdentityKey::ENCODED_LEN);
    ad.extend_from_slice(&initiator.to_bytes());
    ad.extend_from_slice(&responder.to_bytes());
    ad
}

fn derive<P: CryptoPrimitives>(
    primitives: &P,
    agreements: &[SharedSecret],
) -> Result<(SymmetricKey, SymmetricKey), HandshakeError> {
    let mut ikm = Vec::with_capacity(PAD.len() + 32 * agreements.len());
    ikm.extend_from_slice(&PAD);
    for agreement in agreements {
        ikm.extend_from_slice(agreement.as_bytes());
    }

    let mut okm = [0u8; 64];
    let result = primitives.hkdf(Some(&[0u8; 32]), &ikm, X3DH_INFO, &mut okm);
    ikm.zeroize();
    result?;

    let shared_secret = SymmetricKey::from_slice(&okm[..32]);
    let root_key = SymmetricKey::from_slice(&okm[32..]);
    okm.zeroize();

    Ok((shared_secret?, root_key?))
}
