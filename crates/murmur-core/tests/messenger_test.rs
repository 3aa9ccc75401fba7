//! End-to-end flows through the `Messenger` facade.
//!
//! These tests verify critical invariants:
//! - Sessions and group chains survive a restart on durable storage
//! - Concurrent encrypts on one session never reuse a message number
//! - Injected storage failures are transient and lose no state
//! - A member removed by a hard rotation cannot read the new epoch
//! - An earlier handshake replayed after re-establishment is rejected

use std::collections::HashSet;

use murmur_core::{
    ChaoticStorage, CoreConfig, GroupRatchetError, Incoming, ManualClock, MemoryDirectory,
    MemoryStorage, Messenger, MessengerError, RedbStorage, SecureStorage, WireMessage,
};
use murmur_crypto::RustCryptoPrimitives;

type Device<S> = Messenger<S, RustCryptoPrimitives, ManualClock, MemoryDirectory>;

fn config() -> CoreConfig {
    CoreConfig { one_time_prekey_batch: 10, ..CoreConfig::default() }
}

async fn device<S: SecureStorage>(
    id: &str,
    seed: u8,
    storage: S,
    directory: &MemoryDirectory,
) -> Device<S> {
    let device = Messenger::open(
        id,
        storage,
        RustCryptoPrimitives::from_seed([seed; 32]),
        ManualClock::starting_at(1_700_000_000),
        directory.clone(),
        config(),
    )
    .expect("open messenger");
    device.initialize().expect("identity");
    device.publish_pre_keys().await.expect("publish");
    device
}

fn plaintext(incoming: Incoming) -> Vec<u8> {
    match incoming {
        Incoming::Message { plaintext, .. } | Incoming::GroupMessage { plaintext, .. } => plaintext,
        other => panic!("expected application data, got {other:?}"),
    }
}

/// INVARIANT: a device reopened from the same database continues its
/// sessions and group chains.
#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("alice.redb");
    let directory = MemoryDirectory::new();
    let bob = device("bob", 2, MemoryStorage::new(), &directory).await;
    let members = vec!["alice".to_string(), "bob".to_string()];

    {
        let alice = device("alice", 1, RedbStorage::open(&path).expect("open"), &directory).await;
        alice.start_session("bob").await.expect("session");
        let hello = alice.encrypt("bob", b"before restart").expect("encrypt");
        assert_eq!(plaintext(bob.receive("alice", &hello).expect("receive")), b"before restart");

        let outbound = alice.distribute_sender_key("team", 1, &members).await.expect("distribute");
        for outbound in outbound {
            bob.receive("alice", &outbound.bytes).expect("install");
        }
    }

    let alice = Messenger::open(
        "alice",
        RedbStorage::open(&path).expect("reopen"),
        RustCryptoPrimitives::from_seed([11; 32]),
        ManualClock::starting_at(1_700_000_100),
        directory.clone(),
        config(),
    )
    .expect("reopen messenger");

    let pairwise = alice.encrypt("bob", b"after restart").expect("encrypt");
    assert_eq!(plaintext(bob.receive("alice", &pairwise).expect("receive")), b"after restart");

    let group = alice.group_encrypt("team", 1, b"group after restart").expect("group encrypt");
    assert_eq!(plaintext(bob.receive("alice", &group).expect("receive")), b"group after restart");
}

/// INVARIANT: concurrent encrypts on one session get distinct message
/// numbers and all decrypt on the other side.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_encrypts_on_one_session() {
    const MESSAGES: usize = 40;

    let directory = MemoryDirectory::new();
    let alice = device("alice", 1, MemoryStorage::new(), &directory).await;
    let bob = device("bob", 2, MemoryStorage::new(), &directory).await;
    alice.start_session("bob").await.expect("session");

    let tasks: Vec<_> = (0..MESSAGES)
        .map(|i| {
            let alice = alice.clone();
            tokio::spawn(async move { alice.encrypt("bob", format!("{i}").as_bytes()) })
        })
        .collect();

    let mut wire = Vec::with_capacity(MESSAGES);
    for task in tasks {
        wire.push(task.await.expect("task").expect("encrypt"));
    }

    let numbers: HashSet<u32> = wire
        .iter()
        .map(|bytes| match WireMessage::decode(bytes).expect("decode") {
            WireMessage::Pairwise(message) => message.header.message_number,
            WireMessage::Group(_) => panic!("expected pairwise"),
        })
        .collect();
    assert_eq!(numbers.len(), MESSAGES);

    let mut received = HashSet::new();
    for bytes in &wire {
        received.insert(plaintext(bob.receive("alice", bytes).expect("receive")));
    }
    assert_eq!(received.len(), MESSAGES);
}

/// INVARIANT: once a session is established, random storage failures on
/// receive are transient and retrying delivers every message exactly once.
#[tokio::test]
async fn random_storage_failures_are_retryable() {
    let directory = MemoryDirectory::new();
    let alice = device("alice", 1, MemoryStorage::new(), &directory).await;
    let bob_storage = MemoryStorage::new();
    let bob = device("bob", 2, bob_storage.clone(), &directory).await;

    alice.start_session("bob").await.expect("session");
    let hello = alice.encrypt("bob", b"hello").expect("encrypt");
    bob.receive("alice", &hello).expect("receive");
    let ack = bob.encrypt("alice", b"ack").expect("encrypt");
    alice.receive("bob", &ack).expect("receive");

    // Opening reads the key store, which may itself hit an injected failure
    let mut attempt = 0;
    let flaky_bob = loop {
        attempt += 1;
        let opened = Messenger::open(
            "bob",
            ChaoticStorage::with_seed(bob_storage.clone(), 0.3, 42 + attempt),
            RustCryptoPrimitives::from_seed([12; 32]),
            ManualClock::starting_at(1_700_000_000),
            directory.clone(),
            config(),
        );
        match opened {
            Ok(device) => break device,
            Err(err) => assert!(err.is_transient(), "unexpected error {err:?}"),
        }
    };

    let mut failures = 0;
    for i in 0..30u8 {
        let bytes = alice.encrypt("bob", &[i]).expect("encrypt");
        let received = loop {
            match flaky_bob.receive("alice", &bytes) {
                Ok(incoming) => break plaintext(incoming),
                Err(err) => {
                    assert!(err.is_transient(), "unexpected error {err:?}");
                    failures += 1;
                },
            }
        };
        assert_eq!(received, [i]);
    }
    assert!(failures > 0, "chaos injected no failures");

    // The reliable view of the same storage continues the session
    let reply = bob.encrypt("alice", b"all received").expect("encrypt");
    assert_eq!(plaintext(alice.receive("bob", &reply).expect("receive")), b"all received");
}

/// INVARIANT: after `rotate_group_epoch` without a member, that member
/// cannot read new group traffic.
#[tokio::test]
async fn hard_rotation_excludes_removed_member() {
    let directory = MemoryDirectory::new();
    let alice = device("alice", 1, MemoryStorage::new(), &directory).await;
    let bob = device("bob", 2, MemoryStorage::new(), &directory).await;
    let carol = device("carol", 3, MemoryStorage::new(), &directory).await;

    let everyone = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
    for outbound in alice.distribute_sender_key("team", 1, &everyone).await.expect("distribute") {
        let member = if outbound.recipient == "bob" { &bob } else { &carol };
        member.receive("alice", &outbound.bytes).expect("install");
    }
    let before = alice.group_encrypt("team", 1, b"all of us").expect("encrypt");
    assert_eq!(plaintext(carol.receive("alice", &before).expect("receive")), b"all of us");

    let remaining = vec!["alice".to_string(), "bob".to_string()];
    let outbound = alice.rotate_group_epoch("team", 2, &remaining).await.expect("rotate");
    assert_eq!(outbound.len(), 1);
    bob.receive("alice", &outbound[0].bytes).expect("install new epoch");

    let after = alice.group_encrypt("team", 2, b"without carol").expect("encrypt");
    assert_eq!(plaintext(bob.receive("alice", &after).expect("receive")), b"without carol");

    let err = carol.receive("alice", &after).expect_err("carol is removed");
    assert!(matches!(
        err,
        MessengerError::Group(GroupRatchetError::MissingChainSeed { epoch: 2, .. })
    ));


    // Bob has moved on; old-epoch traffic is stale for him
    let stale = carol.group_encrypt("team", 1, b"still here?").expect("encrypt");
    assert!(matches!(
        bob.receive("carol", &stale),
        Err(MessengerError::Group(GroupRatchetError::StaleEpoch { current: 2, received: 1 }))
    ));
}

/// INVARIANT: an expired bundle is a transient condition; publishing again
/// makes the peer reachable.
#[tokio::test]
async fn expired_bundle_is_retryable() {
    let directory = MemoryDirectory::new();
    let alice = device("alice", 1, MemoryStorage::new(), &directory).await;
    let bob = device("bob", 2, MemoryStorage::new(), &directory).await;

    directory.expire("bob").await;
    let err = alice.start_session("bob").await.expect_err("bundle expired");
    assert!(err.is_transient());

    bob.publish_pre_keys().await.expect("republish");
    alice.start_session("bob").await.expect("session");
    let hello = alice.encrypt("bob", b"found you").expect("encrypt");
    assert_eq!(plaintext(bob.receive("alice", &hello).expect("receive")), b"found you");
}

/// INVARIANT: after the session is re-established, a first-flight message of
/// an earlier handshake is rejected and the live session keeps decrypting.
#[tokio::test]
async fn replayed_handshake_is_rejected() {
    let directory = MemoryDirectory::new();
    let alice = device("alice", 1, MemoryStorage::new(), &directory).await;
    let bob = device("bob", 2, MemoryStorage::new(), &directory).await;

    alice.start_session("bob").await.expect("first session");
    let first = alice.encrypt("bob", b"first").expect("encrypt");
    assert_eq!(plaintext(bob.receive("alice", &first).expect("receive")), b"first");

    // The directory handed out the one-time prekey already, so this handshake
    // only uses the signed prekey and could be answered again
    alice.start_session("bob").await.expect("second session");
    let old = alice.encrypt("bob", b"old secret").expect("encrypt");
    assert_eq!(plaintext(bob.receive("alice", &old).expect("receive")), b"old secret");

    alice.start_session("bob").await.expect("third session");
    let hello = alice.encrypt("bob", b"third").expect("encrypt");
    assert_eq!(plaintext(bob.receive("alice", &hello).expect("receive")), b"third");
    let ack = bob.encrypt("alice", b"ack").expect("encrypt");
    assert_eq!(plaintext(alice.receive("bob", &ack).expect("receive")), b"ack");

    for replay in [&old, &first] {
        let err = bob.receive("alice", replay).expect_err("replay must be rejected");
        assert_eq!(err, MessengerError::HandshakeReplayed { peer: "alice".to_string() });
        assert!(err.is_fatal());
    }

    let live = alice.encrypt("bob", b"still live").expect("encrypt");
    assert_eq!(plaintext(bob.receive("alice", &live).expect("receive")), b"still live");
    let reply = bob.encrypt("alice", b"both ways").expect("encrypt");
    assert_eq!(plaintext(alice.receive("bob", &reply).expect("receive")), b"both ways");
}
