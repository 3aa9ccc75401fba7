//! Messenger facade.
//!
//! Wires the key store, pairwise sessions, group ratchet, trust store and
//! key-distribution directory into one device-level API that speaks the
//! [wire format](crate::wire).
//!
//! # Flows
//!
//! ```text
//! start_session(peer)        fetch bundle ─▶ trust check ─▶ X3DH initiate ─▶ save
//! encrypt(peer, data)        Application envelope ─▶ ratchet ─▶ wire bytes
//! receive(peer, bytes)       wire ─▶ (respond to handshake) ─▶ ratchet ─▶ envelope
//! distribute_sender_key      our chain seed ─▶ pairwise to every member
//! group_encrypt              sender chain ─▶ wire bytes (fan out by transport)
//! ```
//!
//! Only bundle fetch and upload suspend. Every state transition after them
//! is a synchronous call that persists before returning, so cancelling a
//! flow at an await point commits nothing.

use murmur_crypto::CryptoPrimitives;
use tracing::{debug, info, warn};

use crate::{
    config::CoreConfig,
    distribution::KeyDistribution,
    env::Environment,
    error::{KeyStoreError, MessengerError, RatchetError},
    fingerprint::SafetyNumber,
    group::GroupRatchet,
    handshake::{self, HandshakeMessage},
    keystore::{IdentityKey, KeyStore, PreKeyBundle},
    ratchet::{RatchetMessage, RatchetSession},
    session_store::SessionStore,
    storage::{SecureStorage, StorageError},
    trust::{IdentityChange, TrustStore},
    wire::{PairwisePayload, WireMessage},
};

/// Result of processing one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    /// Pairwise application data
    Message {
        /// Pairwise peer
        sender: String,
        /// Decrypted data
        plaintext: Vec<u8>,
    },
    /// Group application data
    GroupMessage {
        /// Group identifier
        group_id: String,
        /// Epoch the message was sent in
        epoch: u64,
        /// Sending member
        sender: String,
        /// Decrypted data
        plaintext: Vec<u8>,
    },
    /// A member's sender chain was installed
    SenderKeyInstalled {
        /// Group identifier
        group_id: String,
        /// Epoch of the chain
        epoch: u64,
        /// Member whose chain it is
        sender: String,
    },
    /// A member asked for our sender chain.
    ///
    /// Answer with [`Messenger::send_sender_key`] if they belong to the group.
    SenderKeyRequested {
        /// Member asking
        requester: String,
        /// Group identifier
        group_id: String,
        /// Epoch the chain is needed for
        epoch: u64,
    },
}

/// An encoded message for one recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Recipient
    pub recipient: String,
    /// Encoded [`WireMessage`]
    pub bytes: Vec<u8>,
}

/// One device's messaging core.
#[derive(Clone)]
pub struct Messenger<S, P, E, D> {
    local_id: String,
    config: CoreConfig,
    keystore: KeyStore<S, P, E>,
    sessions: SessionStore<S, P>,
    groups: GroupRatchet<S, P>,
    trust: TrustStore<S>,
    directory: D,
}

impl<S, P, E, D> Messenger<S, P, E, D>
where
    S: SecureStorage,
    P: CryptoPrimitives,
    E: Environment,
    D: KeyDistribution,
{
    /// Open the messaging core of `local_id` over `storage`.
    pub fn open(
        local_id: impl Into<String>,
        storage: S,
        primitives: P,
        env: E,
        directory: D,
        config: CoreConfig,
    ) -> Result<Self, MessengerError> {
        let keystore = KeyStore::open(storage.clone(), primitives.clone(), env, config.clone())?;
        Ok(Self {
            local_id: local_id.into(),
            sessions: SessionStore::new(storage.clone(), primitives.clone(), config.clone()),
            groups: GroupRatchet::new(storage.clone(), primitives, config.clone()),
            trust: TrustStore::new(storage),
            keystore,
            directory,
            config,
        })
    }

    /// Our user id.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Our public identity, once generated.
    pub fn identity(&self) -> Option<IdentityKey> {
        self.keystore.identity().map(|identity| identity.public())
    }

    /// Generate the identity on first run. Returns the existing one afterwards.
    pub fn initialize(&self) -> Result<IdentityKey, MessengerError> {
        Ok(self.keystore.generate_identity()?.public())
    }

    /// Top up prekeys and publish the current bundle.
    pub async fn publish_pre_keys(&self) -> Result<PreKeyBundle, MessengerError> {
        let bundle = self.keystore.ensure_pre_keys(self.config.one_time_prekey_batch)?;
        self.directory.upload_pre_key_bundle(&self.local_id, bundle.clone()).await?;

        info!(
            user = %self.local_id,
            signed_pre_key_id = bundle.signed_pre_key_id,
            pool = self.keystore.one_time_pre_key_count(),
            "prekeys published"
        );
        Ok(bundle)
    }

    /// Start a session with `peer` from their published bundle, replacing
    /// any existing one.
    ///
    /// Fails with [`MessengerError::IdentityChanged`] if the bundle carries
    /// an identity other than the trusted one.
    pub async fn start_session(&self, peer: &str) -> Result<(), MessengerError> {
        let bundle = self.directory.fetch_pre_key_bundle(peer).await?;

        if let IdentityChange::Changed { .. } = self.trust.check(peer, &bundle.identity_key)? {
            return Err(MessengerError::IdentityChanged { peer: peer.to_string() });
        }

        let local = self.keystore.identity().ok_or(KeyStoreError::NoIdentity)?;
        let (output, message) = handshake::initiate(self.keystore.primitives(), &local, &bundle)?;
        let mut session = RatchetSession::new(output, Some(message), &self.config);
        self.sessions.update(peer, |existing| {
            if let Some(previous) = &existing {
                session.succeed(previous);
            }
            Ok::<_, StorageError>((session, ()))
        })?;
        self.trust.check_and_remember(peer, &bundle.identity_key)?;

        info!(peer, "session started");
        Ok(())
    }

    /// Encrypt application data for `peer`. A session must exist.
    pub fn encrypt(&self, peer: &str, plaintext: &[u8]) -> Result<Vec<u8>, MessengerError> {
        self.send_payload(peer, &PairwisePayload::Application(plaintext.to_vec()))
    }

    /// Process one inbound message from `peer`.
    pub fn receive(&self, peer: &str, bytes: &[u8]) -> Result<Incoming, MessengerError> {
        match WireMessage::decode(bytes)? {
            WireMessage::Pairwise(message) => self.receive_pairwise(peer, &message),
            WireMessage::Group(message) => {
                let plaintext = self.groups.decrypt(&message)?;
                Ok(Incoming::GroupMessage {
                    group_id: message.group_id,
                    epoch: message.epoch,
                    sender: message.sender_id,
                    plaintext,
                })
            },
        }
    }

    /// Encrypt application data for `group` at `epoch` with our sender chain.
    ///
    /// The result goes to every member. Members must already hold our chain
    /// (see [`distribute_sender_key`](Self::distribute_sender_key)).
    pub fn group_encrypt(
        &self,
        group: &str,
        epoch: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, MessengerError> {
        let message = self.groups.encrypt(group, epoch, &self.local_id, plaintext)?;
        Ok(WireMessage::Group(message).encode()?)
    }

    /// Send our sender chain for `group` at `epoch` to each of `members`,
    /// starting sessions where none exist.
    pub async fn distribute_sender_key(
        &self,
        group: &str,
        epoch: u64,
        members: &[String],
    ) -> Result<Vec<Outbound>, MessengerError> {
        self.ensure_sessions(members).await?;

        let distribution = self.groups.sender_key_distribution(group, epoch, &self.local_id)?;
        self.fan_out(members, &PairwisePayload::SenderKeyDistribution(distribution))
    }

    /// Send our sender chain for `group` at `epoch` to one member, typically
    /// in answer to [`Incoming::SenderKeyRequested`].
    pub fn send_sender_key(
        &self,
        group: &str,
        epoch: u64,
        peer: &str,
    ) -> Result<Vec<u8>, MessengerError> {
        let distribution = self.groups.sender_key_distribution(group, epoch, &self.local_id)?;
        self.send_payload(peer, &PairwisePayload::SenderKeyDistribution(distribution))
    }

    /// Ask `sender` for their chain, after a group message failed with a
    /// missing chain seed.
    pub fn request_sender_key(
        &self,
        group: &str,
        epoch: u64,
        sender: &str,
    ) -> Result<Vec<u8>, MessengerError> {
        let request = PairwisePayload::SenderKeyRequest {
            group_id: group.to_string(),
            epoch,
            sender_id: sender.to_string(),
        };
        self.send_payload(sender, &request)
    }

    /// Hard rotation after a membership change: move `group` to `new_epoch`
    /// and send a fresh chain to the remaining `members`.
    ///
    /// Chains of earlier epochs are deleted, so a removed member holding an
    /// old seed cannot read anything sent from now on.
    pub async fn rotate_group_epoch(
        &self,
        group: &str,
        new_epoch: u64,
        members: &[String],
    ) -> Result<Vec<Outbound>, MessengerError> {
        self.ensure_sessions(members).await?;
        self.groups.advance_epoch(group, new_epoch)?;

        let distribution = self.groups.sender_key_distribution(group, new_epoch, &self.local_id)?;
        info!(group, epoch = new_epoch, members = members.len(), "group epoch rotated");
        self.fan_out(members, &PairwisePayload::SenderKeyDistribution(distribution))
    }

    /// Soft rotation: replace our chain in the current epoch and send the new
    /// generation to `members`.
    pub async fn rotate_sender_key(
        &self,
        group: &str,
        epoch: u64,
        members: &[String],
    ) -> Result<Vec<Outbound>, MessengerError> {
        self.ensure_sessions(members).await?;

        let distribution = self.groups.rotate_sender_chain(group, epoch, &self.local_id)?;
        self.fan_out(members, &PairwisePayload::SenderKeyDistribution(distribution))
    }

    /// Delete every chain of `group`.
    pub fn leave_group(&self, group: &str) -> Result<(), MessengerError> {
        self.groups.forget_group(group)?;
        info!(group, "group left");
        Ok(())
    }

    /// Safety number for the conversation with `peer`, once their identity
    /// is known.
    pub fn safety_number(&self, peer: &str) -> Result<Option<SafetyNumber>, MessengerError> {
        let Some(local) = self.identity() else {
            return Ok(None);
        };
        let remote = self.trust.trusted(peer)?;
        Ok(remote.map(|remote| SafetyNumber::new(&self.local_id, &local, peer, &remote)))
    }

    /// Accept `identity` for `peer` after the user verified it, for example
    /// following [`MessengerError::IdentityChanged`].
    pub fn trust_identity(&self, peer: &str, identity: &IdentityKey) -> Result<(), MessengerError> {
        self.trust.trust(peer, identity)?;
        Ok(())
    }

    /// Drop the session with `peer`. The next exchange needs a new handshake.
    pub fn reset_session(&self, peer: &str) -> Result<(), MessengerError> {
        self.sessions.reset(peer)?;
        Ok(())
    }

    /// Whether a session with `peer` exists.
    pub fn has_session(&self, peer: &str) -> Result<bool, MessengerError> {
        Ok(self.sessions.contains(peer)?)
    }

    async fn ensure_sessions(&self, members: &[String]) -> Result<(), MessengerError> {
        for member in members.iter().filter(|member| **member != self.local_id) {
            if !self.sessions.contains(member)? {
                self.start_session(member).await?;
            }
        }
        Ok(())
    }

    fn fan_out(
        &self,
        members: &[String],
        payload: &PairwisePayload,
    ) -> Result<Vec<Outbound>, MessengerError> {
        members
            .iter()
            .filter(|member| **member != self.local_id)
            .map(|member| {
                let bytes = self.send_payload(member, payload)?;
                Ok(Outbound { recipient: member.clone(), bytes })
            })
            .collect()
    }

    fn send_payload(
        &self,
        peer: &str,
        payload: &PairwisePayload,
    ) -> Result<Vec<u8>, MessengerError> {
        let message = self.sessions.encrypt(peer, &payload.encode()?)?;
        Ok(WireMessage::Pairwise(message).encode()?)
    }

    fn receive_pairwise(
        &self,
        peer: &str,
        message: &RatchetMessage,
    ) -> Result<Incoming, MessengerError> {
        if let Some(handshake) = &message.handshake {
            if let IdentityChange::Changed { .. } =
                self.trust.check(peer, &handshake.initiator_identity)?
            {
                return Err(MessengerError::IdentityChanged { peer: peer.to_string() });
            }
        }

        let (plaintext, remote_identity) = self.sessions.update(peer, |existing| {
            let mut session = match (existing, &message.handshake) {
                (Some(session), Some(handshake)) if session.answered_earlier(handshake) => {
                    warn!(peer, "replayed handshake rejected");
                    return Err(MessengerError::HandshakeReplayed { peer: peer.to_string() });
                },
                (Some(session), Some(handshake)) if supersedes(&session, handshake) => {
                    debug!(peer, "inbound handshake replaces session");
                    let mut replacement = self.answer(handshake)?;
                    replacement.succeed(&session);
                    replacement
                },
                (Some(session), Some(_)) if session.has_pending_handshake() => {
                    return Err(MessengerError::HandshakeSuperseded { peer: peer.to_string() });
                },
                (Some(session), _) => session,
                (None, Some(handshake)) => self.answer(handshake)?,
                (None, None) => {
                    return Err(RatchetError::NoSession { peer: peer.to_string() }.into());
                },
            };
            let plaintext = session.decrypt(self.keystore.primitives(), message)?;
            let identity = session.remote_identity();
            Ok((session, (plaintext, identity)))
        })?;

        if message.handshake.is_some() {
            self.trust.check_and_remember(peer, &remote_identity)?;
        }

        match PairwisePayload::decode(&plaintext)? {
            PairwisePayload::Application(plaintext) => {
                Ok(Incoming::Message { sender: peer.to_string(), plaintext })
            },
            PairwisePayload::SenderKeyDistribution(distribution) => {
                if distribution.sender_id != peer {
                    warn!(peer, claimed = %distribution.sender_id, "sender key for another member");
                    return Err(MessengerError::UnexpectedSender {
                        peer: peer.to_string(),
                        claimed: distribution.sender_id,
                    });
                }
                self.groups.install_chain(&distribution)?;
                Ok(Incoming::SenderKeyInstalled {
                    group_id: distribution.group_id,
                    epoch: distribution.epoch,
                    sender: distribution.sender_id,
                })
            },
            PairwisePayload::SenderKeyRequest { group_id, epoch, sender_id } => {
                if sender_id != self.local_id {
                    return Err(MessengerError::UnexpectedSender {
                        peer: peer.to_string(),
                        claimed: sender_id,
                    });
                }
                Ok(Incoming::SenderKeyRequested { requester: peer.to_string(), group_id, epoch })
            },
        }
    }

    /// Responder side of X3DH for an inbound handshake.
    fn answer(&self, handshake: &HandshakeMessage) -> Result<RatchetSession, MessengerError> {
        let output = handshake::respond(&self.keystore, handshake)?;
        Ok(RatchetSession::from_handshake(output, handshake, &self.config))
    }
}

/// Whether an inbound handshake replaces `session`.
///
/// When both sides initiated at once, the handshake with the smaller
/// ephemeral key wins on both ends.
fn supersedes(session: &RatchetSession, incoming: &HandshakeMessage) -> bool {
    match session.pending_handshake() {
        Some(ours) => incoming.ephemeral_key < ours.ephemeral_key,
        None => !session.was_created_by(incoming),
    }
}

#[cfg(test)]
mod tests {
    use murmur_crypto::RustCryptoPrimitives;

    use super::*;
    use crate::{
        distribution::MemoryDirectory, env::ManualClock, error::GroupRatchetError,
        storage::MemoryStorage,
    };

    type TestMessenger =
        Messenger<MemoryStorage, RustCryptoPrimitives, ManualClock, MemoryDirectory>;

    async fn device(id: &str, seed: u8, directory: &MemoryDirectory) -> TestMessenger {
        let messenger = Messenger::open(
            id,
            MemoryStorage::new(),
            RustCryptoPrimitives::from_seed([seed; 32]),
            ManualClock::starting_at(0),
            directory.clone(),
            CoreConfig { one_time_prekey_batch: 5, ..CoreConfig::default() },
        )
        .unwrap();
        messenger.initialize().unwrap();
        messenger.publish_pre_keys().await.unwrap();
        messenger
    }

    fn message(incoming: Incoming) -> Vec<u8> {
        match incoming {
            Incoming::Message { plaintext, .. } | Incoming::GroupMessage { plaintext, .. } => {
                plaintext
            },
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pairwise_conversation() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;
        let bob = device("bob", 2, &directory).await;

        alice.start_session("bob").await.unwrap();
        let hello = alice.encrypt("bob", b"hello bob").unwrap();
        assert_eq!(message(bob.receive("alice", &hello).unwrap()), b"hello bob");

        let reply = bob.encrypt("alice", b"hi alice").unwrap();
        assert_eq!(message(alice.receive("bob", &reply).unwrap()), b"hi alice");

        let again = alice.encrypt("bob", b"again").unwrap();
        assert_eq!(message(bob.receive("alice", &again).unwrap()), b"again");
    }

    #[tokio::test]
    async fn safety_numbers_match_after_first_exchange() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;
        let bob = device("bob", 2, &directory).await;

        assert_eq!(alice.safety_number("bob").unwrap(), None);

        alice.start_session("bob").await.unwrap();
        bob.receive("alice", &alice.encrypt("bob", b"x").unwrap()).unwrap();

        assert_eq!(alice.safety_number("bob").unwrap(), bob.safety_number("alice").unwrap());
    }

    #[tokio::test]
    async fn changed_identity_blocks_new_sessions() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;
        let _bob = device("bob", 2, &directory).await;
        alice.start_session("bob").await.unwrap();

        // Bob reinstalls with a new identity under the same id
        let reinstalled = device("bob", 3, &directory).await;
        let err = alice.start_session("bob").await.unwrap_err();
        assert_eq!(err, MessengerError::IdentityChanged { peer: "bob".to_string() });
        assert!(err.is_fatal());

        alice.trust_identity("bob", &reinstalled.identity().unwrap()).unwrap();
        alice.start_session("bob").await.unwrap();
        let hello = alice.encrypt("bob", b"welcome back").unwrap();
        assert_eq!(message(reinstalled.receive("alice", &hello).unwrap()), b"welcome back");
    }

    #[tokio::test]
    async fn simultaneous_initiation_converges() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;
        let bob = device("bob", 2, &directory).await;

        alice.start_session("bob").await.unwrap();
        bob.start_session("alice").await.unwrap();
        let from_alice = alice.encrypt("bob", b"a").unwrap();
        let from_bob = bob.encrypt("alice", b"b").unwrap();

        let at_bob = bob.receive("alice", &from_alice);
        let at_alice = alice.receive("bob", &from_bob);

        // Exactly one handshake wins; the loser's first message is a benign race
        let (winner_result, loser_result) =
            if at_bob.is_ok() { (at_bob, at_alice) } else { (at_alice, at_bob) };
        assert!(winner_result.is_ok());
        assert!(loser_result.unwrap_err().is_benign_race());

        let ping = alice.encrypt("bob", b"ping").unwrap();
        assert_eq!(message(bob.receive("alice", &ping).unwrap()), b"ping");
        let pong = bob.encrypt("alice", b"pong").unwrap();
        assert_eq!(message(alice.receive("bob", &pong).unwrap()), b"pong");
    }

    #[tokio::test]
    async fn group_flow_with_missing_seed_and_request() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;
        let bob = device("bob", 2, &directory).await;
        let members = vec!["alice".to_string(), "bob".to_string()];

        let outbound = alice.distribute_sender_key("team", 1, &members).await.unwrap();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].recipient, "bob");
        assert_eq!(
            bob.receive("alice", &outbound[0].bytes).unwrap(),
            Incoming::SenderKeyInstalled {
                group_id: "team".to_string(),
                epoch: 1,
                sender: "alice".to_string()
            }
        );

        let broadcast = alice.group_encrypt("team", 1, b"hello team").unwrap();
        assert_eq!(message(bob.receive("alice", &broadcast).unwrap()), b"hello team");

        // Bob's chain never reached Alice: she asks for it
        let from_bob = bob.group_encrypt("team", 1, b"from bob").unwrap();
        let err = alice.receive("bob", &from_bob).unwrap_err();
        assert!(matches!(err, MessengerError::Group(GroupRatchetError::MissingChainSeed { .. })));
        assert!(err.is_transient());

        let request = alice.request_sender_key("team", 1, "bob").unwrap();
        let Incoming::SenderKeyRequested { requester, group_id, epoch } =
            bob.receive("alice", &request).unwrap()
        else {
            panic!("expected a sender key request");
        };
        let answer = bob.send_sender_key(&group_id, epoch, &requester).unwrap();
        alice.receive("bob", &answer).unwrap();

        // Bob's chain was distributed at its position after the first message
        let next = bob.group_encrypt("team", 1, b"second").unwrap();
        assert_eq!(message(alice.receive("bob", &next).unwrap()), b"second");
    }

    #[tokio::test]
    async fn sender_key_traffic_is_bound_to_peer() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;
        let mallory = device("mallory", 4, &directory).await;

        let outbound =
            alice.distribute_sender_key("team", 1, &["mallory".to_string()]).await.unwrap();
        mallory.receive("alice", &outbound[0].bytes).unwrap();

        // Alice's installed chain cannot be re-sent as Mallory's own
        assert!(matches!(
            mallory.groups.sender_key_distribution("team", 1, "alice"),
            Err(GroupRatchetError::ForeignChain { .. })
        ));

        // Mallory's chain relabelled as Alice's is refused
        let mut forged = mallory.groups.sender_key_distribution("team", 1, "mallory").unwrap();
        forged.sender_id = "alice".to_string();
        let bytes =
            mallory.send_payload("alice", &PairwisePayload::SenderKeyDistribution(forged)).unwrap();
        assert_eq!(
            alice.receive("mallory", &bytes),
            Err(MessengerError::UnexpectedSender {
                peer: "mallory".to_string(),
                claimed: "alice".to_string()
            })
        );

        // Requests must name the recipient's own chain
        let request = PairwisePayload::SenderKeyRequest {
            group_id: "team".to_string(),
            epoch: 1,
            sender_id: "carol".to_string(),
        };
        let bytes = mallory.send_payload("alice", &request).unwrap();
        assert_eq!(
            alice.receive("mallory", &bytes),
            Err(MessengerError::UnexpectedSender {
                peer: "mallory".to_string(),
                claimed: "carol".to_string()
            })

        );
    }

    #[tokio::test]
    async fn missing_bundle_is_transient() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;

        let err = alice.start_session("nobody").await.unwrap_err();
        assert!(err.is_transient());
        assert!(!alice.has_session("nobody").unwrap());
    }

    #[tokio::test]
    async fn reset_session_requires_new_handshake() {
        let directory = MemoryDirectory::new();
        let alice = device("alice", 1, &directory).await;
        let bob = device("bob", 2, &directory).await;
        alice.start_session("bob").await.unwrap();
        bob.receive("alice", &alice.encrypt("bob", b"x").unwrap()).unwrap();

        alice.reset_session("bob").unwrap();
        assert!(matches!(
            alice.encrypt("bob", b"y"),
            Err(MessengerError::Ratchet(RatchetError::NoSession { .. }))
        ));

        bob.publish_pre_keys().await.unwrap();
        alice.start_session("bob").await.unwrap();
        let fresh = alice.encrypt("bob", b"fresh start").unwrap();
        assert_eq!(message(bob.receive("alice", &fresh).unwrap()), b"fresh start");
    }
}
