//! Fuzz target for the symmetric chain ratchet
//!
//! Drives a chain with arbitrary step and jump sequences, mirrored by a
//! reference chain that only ever steps by one.
//!
//! # Invariants
//!
//! - `advance_to(n)` yields the same keys as stepping to `n` one at a time
//! - A rejected jump (behind, or past the skip bound) leaves the chain unchanged
//! - Message keys round-trip a seal/open and reject a flipped byte

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use murmur_crypto::{ChainKey, RustCryptoPrimitives, SymmetricKey};

const MAX_SKIP: u32 = 64;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: [u8; 32],
    start: u16,
    operations: Vec<Operation>,
}

#[derive(Debug, Arbitrary)]
enum Operation {
    Step,
    Jump { distance: u8 },
    Rewind { distance: u8 },
    Seal { plaintext: Vec<u8>, flip: u8 },
}

fuzz_target!(|scenario: Scenario| {
    let primitives = RustCryptoPrimitives::from_seed(scenario.seed);
    let start = u32::from(scenario.start);
    let mut chain = ChainKey::new(SymmetricKey::from_bytes(scenario.seed), start);
    let mut reference = chain.clone();

    for operation in scenario.operations.into_iter().take(256) {
        match operation {
            Operation::Step => {
                let key = chain.step(&primitives).expect("step");
                let expected = reference.step(&primitives).expect("step");
                assert!(key == expected, "step diverged from reference");
            },
            Operation::Jump { distance } => {
                let target = chain.index() + u32::from(distance);
                let before = chain.clone();
                match chain.advance_to(&primitives, target, MAX_SKIP) {
                    Ok((skipped, key)) => {
                        assert!(u32::from(distance) <= MAX_SKIP);
                        assert_eq!(skipped.len(), usize::from(distance));
                        for skipped_key in skipped {
                            let expected = reference.step(&primitives).expect("step");
                            assert!(skipped_key == expected, "skipped key diverged");
                        }
                        let expected = reference.step(&primitives).expect("step");
                        assert!(key == expected, "target key diverged");
                    },
                    Err(_) => {
                        assert!(u32::from(distance) > MAX_SKIP);
                        assert!(chain == before, "failed jump changed the chain");
                    },
                }
            },
            Operation::Rewind { distance } => {
                let Some(target) = chain.index().checked_sub(u32::from(distance) + 1) else {
                    continue;
                };
                let before = chain.clone();
                assert!(chain.advance_to(&primitives, target, MAX_SKIP).is_err());
                assert!(chain == before, "rewind changed the chain");
            },
            Operation::Seal { plaintext, flip } => {
                let key = chain.message_key(&primitives).expect("message key");
                let mut sealed = key.seal(&primitives, &plaintext, b"fuzz").expect("seal");
                assert_eq!(key.open(&primitives, &sealed, b"fuzz").expect("open"), plaintext);

                let position = usize::from(flip) % sealed.len();
                sealed[position] ^= 0x01;
                assert!(key.open(&primitives, &sealed, b"fuzz").is_err());
            },
        }
    }
});
