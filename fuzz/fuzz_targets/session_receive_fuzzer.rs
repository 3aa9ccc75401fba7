//! Fuzz target for pairwise session decryption
//!
//! Establishes a real session pair, then delivers a mix of genuine messages
//! (in arbitrary order) and corrupted ones to the responder.
//!
//! # Invariants
//!
//! - Decryption never panics
//! - A corrupted message fails and leaves the session unchanged
//! - Every genuine message still decrypts to its plaintext, whatever arrived
//!   before it, as long as it is within the skip bound

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use murmur_core::{
    CoreConfig, KeyStore, ManualClock, MemoryStorage, RatchetSession,
    handshake::{initiate, respond},
};
use murmur_crypto::RustCryptoPrimitives;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u8,
    messages: u8,
    deliveries: Vec<Delivery>,
}

#[derive(Debug, Arbitrary)]
enum Delivery {
    Genuine { index: u8 },
    Corrupt { index: u8, position: u16, mask: u8 },
    Forged { message_number: u32, ciphertext: Vec<u8> },
}

fn keystore(seed: u8) -> KeyStore<MemoryStorage, RustCryptoPrimitives, ManualClock> {
    let store = KeyStore::open(
        MemoryStorage::new(),
        RustCryptoPrimitives::from_seed([seed; 32]),
        ManualClock::starting_at(0),
        CoreConfig::default(),
    )
    .expect("open");
    store.generate_identity().expect("identity");
    store
}

fuzz_target!(|scenario: Scenario| {
    let config = CoreConfig { max_skip: 32, ..CoreConfig::default() };
    let primitives = RustCryptoPrimitives::from_seed([scenario.seed; 32]);
    let alice_keys = keystore(scenario.seed.wrapping_add(1));
    let bob_keys = keystore(scenario.seed.wrapping_add(2));

    let bundle = bob_keys.ensure_pre_keys(1).expect("bundle");
    let alice_identity = alice_keys.identity().expect("identity");
    let (output, handshake) =
        initiate(&primitives, &alice_identity, &bundle).expect("initiate");

    let mut alice = RatchetSession::new(output, Some(handshake.clone()), &config);
    let responder = respond(&bob_keys, &handshake).expect("respond");
    let mut bob = RatchetSession::from_handshake(responder, &handshake, &config);

    let count = usize::from(scenario.messages % 32) + 1;
    let sent: Vec<_> = (0..count)
        .map(|i| alice.encrypt(&primitives, &[i as u8; 8]).expect("encrypt"))
        .collect();
    let mut delivered = vec![false; count];

    for delivery in scenario.deliveries.into_iter().take(128) {
        match delivery {
            Delivery::Genuine { index } => {
                let index = usize::from(index) % count;
                let result = bob.decrypt(&primitives, &sent[index]);
                if delivered[index] {
                    assert!(result.is_err(), "replayed message must fail");
                } else {
                    assert_eq!(result.expect("genuine message"), [index as u8; 8]);
                    delivered[index] = true;
                }
            },
            Delivery::Corrupt { index, position, mask } => {
                let mut message = sent[usize::from(index) % count].clone();
                if mask == 0 || message.ciphertext.is_empty() {
                    continue;
                }
                let position = usize::from(position) % message.ciphertext.len();
                message.ciphertext[position] ^= mask;

                let before = bob.clone();
                assert!(bob.decrypt(&primitives, &message).is_err());
                assert!(bob == before, "failed decrypt changed the session");
            },
            Delivery::Forged { message_number, ciphertext } => {
                let mut message = sent[0].clone();
                message.header.message_number = message_number;
                message.ciphertext = ciphertext;

                let before = bob.clone();
                assert!(bob.decrypt(&primitives, &message).is_err());
                assert!(bob == before, "failed decrypt changed the session");
            },
        }
    }
});
