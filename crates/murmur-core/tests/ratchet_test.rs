//! Pairwise session behaviour through the public API.
//!
//! These tests verify critical invariants:
//! - X3DH gives both sides byte-identical secrets
//! - Out-of-order delivery decrypts every message
//! - The skipped-message bound is enforced before any key is cached
//! - Tampering yields one opaque error whose latency does not depend on the
//!   flipped byte

use std::time::{Duration, Instant};

use murmur_core::{
    CoreConfig, KeyStore, ManualClock, MemoryStorage, RatchetError, RatchetMessage, RatchetSession,
    handshake::{initiate, respond},
};
use murmur_crypto::RustCryptoPrimitives;

type Store = KeyStore<MemoryStorage, RustCryptoPrimitives, ManualClock>;

fn keystore(seed: u8) -> Store {
    let store = KeyStore::open(
        MemoryStorage::new(),
        RustCryptoPrimitives::from_seed([seed; 32]),
        ManualClock::starting_at(1_700_000_000),
        CoreConfig::default(),
    )
    .expect("open key store");
    store.generate_identity().expect("generate identity");
    store
}

/// Alice (initiator) and Bob (responder) sessions after one handshake.
fn session_pair(config: &CoreConfig) -> (RatchetSession, RatchetSession, RustCryptoPrimitives) {
    let primitives = RustCryptoPrimitives::from_seed([9; 32]);
    let alice_keys = keystore(1);
    let bob_keys = keystore(2);

    let bundle = bob_keys.ensure_pre_keys(1).expect("bundle");
    let alice_identity = alice_keys.identity().expect("alice identity");
    let (alice_output, handshake) =
        initiate(&primitives, &alice_identity, &bundle).expect("initiate");
    let bob_output = respond(&bob_keys, &handshake).expect("respond");

    let alice = RatchetSession::new(alice_output, Some(handshake.clone()), config);
    let bob = RatchetSession::from_handshake(bob_output, &handshake, config);
    (alice, bob, primitives)
}

/// INVARIANT: initiate and respond over matching key material agree on
/// every derived byte.
#[test]
fn x3dh_outputs_are_byte_identical() {
    let primitives = RustCryptoPrimitives::from_seed([7; 32]);
    let alice_keys = keystore(1);
    let bob_keys = keystore(2);

    for with_one_time in [true, false] {
        let mut bundle = bob_keys.ensure_pre_keys(1).expect("bundle");
        if !with_one_time {
            bundle.one_time_pre_key = None;
        }

        let alice_identity = alice_keys.identity().expect("identity");
        let (initiator, handshake) =
            initiate(&primitives, &alice_identity, &bundle).expect("initiate");
        let responder = respond(&bob_keys, &handshake).expect("respond");

        assert_eq!(initiator.shared_secret.as_bytes(), responder.shared_secret.as_bytes());
        assert_eq!(initiator.root_key.as_bytes(), responder.root_key.as_bytes());
        assert_eq!(initiator.associated_data, responder.associated_data);
    }
}

/// INVARIANT: messages 1..5 delivered as 5,3,1,4,2 all decrypt.
#[test]
fn out_of_order_delivery() {
    let (mut alice, mut bob, primitives) = session_pair(&CoreConfig::default());

    let messages: Vec<RatchetMessage> = (1..=5)
        .map(|i| alice.encrypt(&primitives, format!("message {i}").as_bytes()).expect("encrypt"))
        .collect();

    for i in [5, 3, 1, 4, 2] {
        let plaintext = bob.decrypt(&primitives, &messages[i - 1]).expect("decrypt");
        assert_eq!(plaintext, format!("message {i}").as_bytes());
    }
    assert_eq!(bob.skipped_key_count(), 0);
}

/// INVARIANT: a message MAX_SKIP + 1 past the chain position fails with
/// `TooManySkippedMessages` and caches nothing. Exactly MAX_SKIP succeeds.
#[test]
fn skipped_message_bound() {
    let config = CoreConfig { max_skip: 50, ..CoreConfig::default() };
    let (mut alice, mut bob, primitives) = session_pair(&config);

    let messages: Vec<RatchetMessage> =
        (0..52).map(|_| alice.encrypt(&primitives, b"x").expect("encrypt")).collect();

    let before = bob.clone();
    assert_eq!(
        bob.decrypt(&primitives, &messages[51]),
        Err(RatchetError::TooManySkippedMessages)
    );
    assert_eq!(bob, before, "rejected message must not change the session");

    bob.decrypt(&primitives, &messages[50]).expect("exactly max_skip skipped");
    assert_eq!(bob.skipped_key_count(), 50);
}

/// INVARIANT: flipping any byte fails with the same opaque error, and
/// latency does not depend on where the flip is.
#[test]
fn tampering_is_opaque_and_uniform() {
    const SAMPLES: usize = 200;

    let (mut alice, mut bob, primitives) = session_pair(&CoreConfig::default());
    let message = alice.encrypt(&primitives, &[0x42; 256]).expect("encrypt");
    let len = message.ciphertext.len();

    let median_failure = |position: usize| -> Duration {
        let mut tampered = message.clone();
        tampered.ciphertext[position] ^= 0x01;

        let mut timings: Vec<Duration> = (0..SAMPLES)
            .map(|_| {
                let start = Instant::now();
                let result = bob.clone().decrypt(&primitives, &tampered);
                let elapsed = start.elapsed();
                assert_eq!(result, Err(RatchetError::DecryptionFailed));
                assert_eq!(result.unwrap_err().to_string(), "decryption failed");
                elapsed
            })
            .collect();
        timings.sort_unstable();
        timings[SAMPLES / 2]
    };

    let nonce = median_failure(0);
    let body = median_failure(len / 2);
    let tag = median_failure(len - 1);

    let fastest = nonce.min(body).min(tag).as_nanos().max(1);
    let slowest = nonce.max(body).max(tag).as_nanos();
    assert!(
        slowest < fastest * 3,
        "failure latency depends on flipped position: nonce {nonce:?}, body {body:?}, tag {tag:?}"
    );

    // The untouched message still decrypts afterwards
    assert_eq!(bob.decrypt(&primitives, &message).expect("decrypt"), vec![0x42; 256]);
}

/// INVARIANT: a header that was tampered with fails like a ciphertext flip.
#[test]
fn header_is_authenticated() {
    let (mut alice, mut bob, primitives) = session_pair(&CoreConfig::default());
    let first = alice.encrypt(&primitives, b"one").expect("encrypt");
    bob.decrypt(&primitives, &first).expect("decrypt");

    let mut message = alice.encrypt(&primitives, b"two").expect("encrypt");
    message.header.previous_chain_length += 1;

    assert_eq!(bob.decrypt(&primitives, &message), Err(RatchetError::DecryptionFailed));
}

/// INVARIANT: replies ratchet the DH keys, and both directions keep working
/// across several round trips with interleaved late messages.
#[test]
fn long_conversation_with_late_messages() {
    let (mut alice, mut bob, primitives) = session_pair(&CoreConfig::default());
    let mut late = Vec::new();

    for round in 0..10u8 {
        let kept = alice.encrypt(&primitives, &[round, 0]).expect("encrypt");
        let delivered = alice.encrypt(&primitives, &[round, 1]).expect("encrypt");
        assert_eq!(bob.decrypt(&primitives, &delivered).expect("decrypt"), [round, 1]);
        late.push((round, kept));

        let reply = bob.encrypt(&primitives, &[round, 2]).expect("encrypt");
        assert_eq!(alice.decrypt(&primitives, &reply).expect("decrypt"), [round, 2]);
    }

    // Only the newest chains are retained; the latest late messages still open
    let retained = CoreConfig::default().max_receiving_chains - 1;
    for (round, message) in late.into_iter().rev().take(retained) {

        assert_eq!(bob.decrypt(&primitives, &message).expect("late message"), [round, 0]);
    }
}
