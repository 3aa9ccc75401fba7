//! Sender-key group ratchet.
//!
//! Each member owns one symmetric chain per group epoch and hands its seed to
//! every other member over pairwise sessions ([`SenderKeyDistribution`]).
//! Encrypting steps the sender's own chain; decrypting steps the local copy
//! of the sender's chain, caching skipped keys up to the configured bound.
//!
//! # Rotation
//!
//! - **Soft**: a sender replaces its own chain with a new generation and
//!   redistributes. Messages from older generations become
//!   [`GroupRatchetError::StaleChain`].
//! - **Hard**: the group moves to a new epoch (membership change). Every
//!   chain of the old epoch is deleted, and messages from it become
//!   [`GroupRatchetError::StaleEpoch`]. Removed members never receive the
//!   new seeds.
//!
//! # Locking
//!
//! Chain operations hold the group lock shared and their chain lock
//! exclusively; epoch changes hold the group lock exclusively. Different
//! senders in one group run in parallel.
//!
//! Every message is signed with a per-chain Ed25519 key whose public half
//! travels in the distribution, so members holding the chain seed still
//! cannot forge messages for another sender.

use std::sync::{PoisonError, RwLock};

use murmur_crypto::{
    ChainKey, CryptoError, CryptoPrimitives, SecretKey, Signature, SigningPublicKey, SkippedKeys,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::CoreConfig,
    error::GroupRatchetError,
    locks::LockTable,
    storage::{self, SecureStorage, StorageError, WriteOp},
};

/// Domain label for group message headers.
const GROUP_MESSAGE_LABEL: &[u8] = b"MurmurGroupMessage";

/// A sender's chain seed, sent to each member over a pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    /// Group identifier
    pub group_id: String,
    /// Group epoch
    pub epoch: u64,
    /// Owner of the chain
    pub sender_id: String,
    /// Chain generation, bumped by soft rotation
    pub generation: u32,
    /// Chain key at the sender's next iteration
    pub chain_key: ChainKey,
    /// Key that verifies the sender's message signatures
    pub signing_key: SigningPublicKey,
}

/// One encrypted group message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Group identifier
    pub group_id: String,
    /// Group epoch
    pub epoch: u64,
    /// Sender identifier
    pub sender_id: String,
    /// Sender chain generation
    pub generation: u32,
    /// Index in the sender chain
    pub iteration: u32,
    /// `nonce ‖ ciphertext ‖ tag`
    pub ciphertext: Vec<u8>,
    /// Sender signature over the header and ciphertext
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SenderChainState {
    generation: u32,
    chain: ChainKey,
    signing_key: SigningPublicKey,
    /// Present only for our own chains
    signing_secret: Option<SecretKey>,
    skipped: SkippedKeys<u32>,
}

#[derive(Serialize, Deserialize)]
enum StoredSenderChain {
    V1(SenderChainState),
}

#[derive(Serialize, Deserialize)]
enum StoredGroupIndex {
    V1 { current_epoch: u64 },
}

type ChainId = (String, u64, String);

/// Sender-key ratchet over every group this installation belongs to.
#[derive(Clone)]
pub struct GroupRatchet<S, P> {
    storage: S,
    primitives: P,
    config: CoreConfig,
    groups: LockTable<String, RwLock<()>>,
    chains: LockTable<ChainId>,
}

impl<S: SecureStorage, P: CryptoPrimitives> GroupRatchet<S, P> {
    /// Create a group ratchet over `storage`.
    pub fn new(storage: S, primitives: P, config: CoreConfig) -> Self {
        Self {
            storage,
            primitives,
            config,
            groups: LockTable::default(),
            chains: LockTable::default(),
        }
    }

    /// Current epoch of `group`, if the group is known.
    pub fn current_epoch(&self, group: &str) -> Result<Option<u64>, StorageError> {
        let stored = storage::load::<_, StoredGroupIndex>(&self.storage, &index_key(group))?;
        Ok(stored.map(|StoredGroupIndex::V1 { current_epoch }| current_epoch))
    }

    /// Encrypt as `sender`, creating our chain for this epoch on first use.
    pub fn encrypt(
        &self,
        group: &str,
        epoch: u64,
        sender: &str,
        plaintext: &[u8],
    ) -> Result<GroupMessage, GroupRatchetError> {
        self.enter_epoch(group, epoch)?;

        self.transact(group, epoch, sender, |state| {
            let mut state = match state {
                Some(state) => state,
                None => self.new_own_chain(0),
            };
            let secret = state
                .signing_secret
                .clone()
                .ok_or_else(|| GroupRatchetError::ForeignChain { sender: sender.to_string() })?;

            let message_key =
                state.chain.step(&self.primitives).map_err(GroupRatchetError::Crypto)?;
            let header =
                message_header(group, epoch, sender, state.generation, message_key.index());
            let ciphertext = message_key
                .seal(&self.primitives, plaintext, &header)
                .map_err(GroupRatchetError::Crypto)?;
            let signature = self.primitives.sign(&secret, &signed_bytes(&header, &ciphertext));

            let message = GroupMessage {
                group_id: group.to_string(),
                epoch,
                sender_id: sender.to_string(),
                generation: state.generation,
                iteration: message_key.index(),
                ciphertext,
                signature,
            };
            Ok((state, message))
        })
    }

    /// Decrypt a message from another member.
    ///
    /// Signature, ciphertext and key lookup failures are all
    /// [`GroupRatchetError::DecryptionFailed`].
    pub fn decrypt(&self, message: &GroupMessage) -> Result<Vec<u8>, GroupRatchetError> {
        let group = message.group_id.as_str();
        let sender = message.sender_id.as_str();

        self.transact(group, message.epoch, sender, |state| {
            let mut state = state.ok_or_else(|| missing_seed(group, message.epoch, sender))?;

            if message.generation < state.generation {
                return Err(GroupRatchetError::StaleChain {
                    current: state.generation,
                    received: message.generation,
                });
            }
            if message.generation > state.generation {
                return Err(missing_seed(group, message.epoch, sender));
            }

            let header =
                message_header(group, message.epoch, sender, message.generation, message.iteration);
            let signed = signed_bytes(&header, &message.ciphertext);
            self.primitives
                .verify(&state.signing_key, &signed, &message.signature)
                .map_err(|_| GroupRatchetError::DecryptionFailed)?;

            let message_key = match state.skipped.take(&state.generation, message.iteration) {
                Some(key) => key,
                None => {
                    if message.iteration < state.chain.index() {
                        return Err(GroupRatchetError::DecryptionFailed);
                    }
                    let gap = message.iteration - state.chain.index();
                    state
                        .skipped
                        .check_capacity(&state.generation, gap, self.config.max_skip)
                        .map_err(map_chain_error)?;
                    let (skipped, key) = state
                        .chain
                        .advance_to(&self.primitives, message.iteration, self.config.max_skip)
                        .map_err(map_chain_error)?;
                    state.skipped.insert_all(&state.generation, skipped);
                    key
                },
            };

            let plaintext = message_key
                .open(&self.primitives, &message.ciphertext, &header)
                .map_err(|_| GroupRatchetError::DecryptionFailed)?;
            Ok((state, plaintext))
        })
    }

    /// Our chain seed for `group` at `epoch`, to send to other members.
    ///
    /// Carries the chain at its current position, so a recipient cannot
    /// decrypt anything sent before.
    pub fn sender_key_distribution(
        &self,
        group: &str,
        epoch: u64,
        sender: &str,
    ) -> Result<SenderKeyDistribution, GroupRatchetError> {
        self.enter_epoch(group, epoch)?;

        self.transact(group, epoch, sender, |state| {
            let state = match state {
                Some(state) if state.signing_secret.is_none() => {
                    return Err(GroupRatchetError::ForeignChain { sender: sender.to_string() });
                },
                Some(state) => state,
                None => self.new_own_chain(0),
            };
            let distribution = distribution(group, epoch, sender, &state);
            Ok((state, distribution))
        })
    }

    /// Soft rotation: replace our chain with the next generation.
    pub fn rotate_sender_chain(
        &self,
        group: &str,
        epoch: u64,
        sender: &str,
    ) -> Result<SenderKeyDistribution, GroupRatchetError> {
        self.enter_epoch(group, epoch)?;

        self.transact(group, epoch, sender, |state| {
            let generation = match state {
                Some(state) if state.signing_secret.is_none() => {
                    return Err(GroupRatchetError::ForeignChain { sender: sender.to_string() });
                },
                Some(state) => state.generation.wrapping_add(1),
                None => 0,
            };
            let state = self.new_own_chain(generation);
            info!(group, epoch, generation, "sender chain rotated");

            let distribution = distribution(group, epoch, sender, &state);
            Ok((state, distribution))
        })
    }

    /// Install a chain seed received from another member.
    ///
    /// A seed for a newer epoch moves the group to that epoch. Re-installing
    /// the current generation keeps the existing chain position.
    pub fn install_chain(
        &self,
        distribution: &SenderKeyDistribution,
    ) -> Result<(), GroupRatchetError> {
        let group = distribution.group_id.as_str();
        let sender = distribution.sender_id.as_str();
        self.enter_epoch(group, distribution.epoch)?;

        self.transact(group, distribution.epoch, sender, |existing| match existing {
            Some(state) if state.signing_secret.is_some() => {
                warn!(group, sender, "ignoring distribution for our own chain");
                Ok((state, ()))
            },
            Some(state) if distribution.generation < state.generation => {
                Err(GroupRatchetError::StaleChain {
                    current: state.generation,
                    received: distribution.generation,
                })
            },
            Some(state) if distribution.generation == state.generation => Ok((state, ())),
            _ => {
                debug!(
                    group,
                    sender,
                    generation = distribution.generation,
                    "sender chain installed"
                );
                let state = SenderChainState {
                    generation: distribution.generation,
                    chain: distribution.chain_key.clone(),
                    signing_key: distribution.signing_key,
                    signing_secret: None,
                    skipped: SkippedKeys::new(),
                };
                Ok((state, ()))
            },
        })
    }

    /// Hard rotation: move `group` to `new_epoch` and delete every chain of
    /// earlier epochs.
    pub fn advance_epoch(&self, group: &str, new_epoch: u64) -> Result<(), GroupRatchetError> {
        let lock = self.groups.get(&group.to_string());
        let _exclusive = lock.write().unwrap_or_else(PoisonError::into_inner);

        let current = self.current_epoch(group)?;
        if let Some(current) = current {
            if new_epoch <= current {
                return Err(GroupRatchetError::StaleEpoch { current, received: new_epoch });
            }
        }
        self.switch_epoch(group, current, new_epoch)?;
        Ok(())
    }

    /// Delete every chain and the epoch index of `group` (leaving it).
    pub fn forget_group(&self, group: &str) -> Result<(), StorageError> {
        let lock = self.groups.get(&group.to_string());
        let _exclusive = lock.write().unwrap_or_else(PoisonError::into_inner);

        let mut batch: Vec<WriteOp> = self
            .storage
            .list_keys(&chain_prefix(group))?
            .into_iter()
            .map(|key| WriteOp::Delete { key })
            .collect();
        batch.push(WriteOp::Delete { key: index_key(group) });
        self.storage.apply(&batch)?;

        info!(group, chains = batch.len() - 1, "group forgotten");
        Ok(())
    }

    /// Make `epoch` current unless the group is already past it.
    fn enter_epoch(&self, group: &str, epoch: u64) -> Result<(), GroupRatchetError> {
        let lock = self.groups.get(&group.to_string());
        let _exclusive = lock.write().unwrap_or_else(PoisonError::into_inner);

        let current = self.current_epoch(group)?;
        match current {
            Some(current) if epoch == current => Ok(()),
            Some(current) if epoch < current => {
                Err(GroupRatchetError::StaleEpoch { current, received: epoch })
            },
            _ => self.switch_epoch(group, current, epoch).map_err(GroupRatchetError::from),
        }
    }

    /// Caller holds the group lock exclusively.
    fn switch_epoch(
        &self,
        group: &str,
        previous: Option<u64>,
        epoch: u64,
    ) -> Result<(), StorageError> {
        // Chains only ever exist for the current epoch
        let mut batch: Vec<WriteOp> = self
            .storage
            .list_keys(&chain_prefix(group))?
            .into_iter()
            .map(|key| WriteOp::Delete { key })
            .collect();
        let purged = batch.len();
        batch.push(WriteOp::Put {
            key: index_key(group),
            value: storage::encode(&StoredGroupIndex::V1 { current_epoch: epoch })?,
        });
        self.storage.apply(&batch)?;

        info!(group, ?previous, epoch, purged, "group epoch advanced");
        Ok(())
    }

    /// Run one chain transition under the group (shared) and chain locks.
    ///
    /// The message epoch must be the current one. The returned state is
    /// persisted before the result is handed back.
    fn transact<T>(
        &self,
        group: &str,
        epoch: u64,
        sender: &str,
        transition: impl FnOnce(
            Option<SenderChainState>,
        ) -> Result<(SenderChainState, T), GroupRatchetError>,
    ) -> Result<T, GroupRatchetError> {
        let group_lock = self.groups.get(&group.to_string());
        let _shared = group_lock.read().unwrap_or_else(PoisonError::into_inner);

        match self.current_epoch(group)? {
            Some(current) if current == epoch => {},
            Some(current) if epoch < current => {
                return Err(GroupRatchetError::StaleEpoch { current, received: epoch });
            },
            _ => return Err(missing_seed(group, epoch, sender)),
        }

        let chain_lock = self.chains.get(&(group.to_string(), epoch, sender.to_string()));
        let _exclusive = chain_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let key = chain_key(group, epoch, sender);
        let current = storage::load::<_, StoredSenderChain>(&self.storage, &key)?
            .map(|StoredSenderChain::V1(state)| state);
        let (state, result) = transition(current)?;
        storage::store(&self.storage, &key, &StoredSenderChain::V1(state))?;

        Ok(result)
    }

    fn new_own_chain(&self, generation: u32) -> SenderChainState {
        let signing = self.primitives.generate_signing_key_pair();
        SenderChainState {
            generation,
            chain: ChainKey::new(self.primitives.generate_symmetric_key(), 0),
            signing_key: signing.public,
            signing_secret: Some(signing.secret),
            skipped: SkippedKeys::new(),
        }
    }
}

fn distribution(
    group: &str,
    epoch: u64,
    sender: &str,
    state: &SenderChainState,
) -> SenderKeyDistribution {
    SenderKeyDistribution {
        group_id: group.to_string(),
        epoch,
        sender_id: sender.to_string(),
        generation: state.generation,
        chain_key: state.chain.clone(),
        signing_key: state.signing_key,
    }
}

fn missing_seed(group: &str, epoch: u64, sender: &str) -> GroupRatchetError {
    GroupRatchetError::MissingChainSeed {
        group: group.to_string(),
        epoch,
        sender: sender.to_string(),
    }
}

fn map_chain_error(err: CryptoError) -> GroupRatchetError {
    match err {
        CryptoError::TooManySkippedKeys { .. } => GroupRatchetError::TooManySkippedMessages,
        _ => GroupRatchetError::DecryptionFailed,
    }
}

/// Authenticated header: label, length-prefixed ids, epoch, generation and
/// iteration. Used as AEAD associated data.
fn message_header(
    group: &str,
    epoch: u64,
    sender: &str,
    generation: u32,
    iteration: u32,
) -> Vec<u8> {
    let mut header =
        Vec::with_capacity(GROUP_MESSAGE_LABEL.len() + group.len() + sender.len() + 24);
    header.extend_from_slice(GROUP_MESSAGE_LABEL);
    header.extend_from_slice(&(group.len() as u32).to_be_bytes());
    header.extend_from_slice(group.as_bytes());
    header.extend_from_slice(&epoch.to_be_bytes());
    header.extend_from_slice(&(sender.len() as u32).to_be_bytes());
    header.extend_from_slice(sender.as_bytes());
    header.extend_from_slice(&generation.to_be_bytes());
    header.extend_from_slice(&iteration.to_be_bytes());
    header
}

fn signed_bytes(header: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(header.len() + ciphertext.len());
    bytes.extend_from_slice(header);
    bytes.extend_from_slice(ciphertext);
    bytes
}

fn chain_prefix(group: &str) -> String {
    format!("group/{}/", hex::encode(group))
}

fn chain_key(group: &str, epoch: u64, sender: &str) -> String {
    format!("{}{epoch:020}/{}", chain_prefix(group), hex::encode(sender))
}

fn index_key(group: &str) -> String {
    format!("group-index/{}", hex::encode(group))
}
