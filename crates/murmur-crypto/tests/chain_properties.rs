//! Property-based tests for the chain ratchet
//!
//! These tests verify the fundamental invariants of the chain ratchet:
//!
//! 1. **Round-trip**: open(seal(m)) == m for all messages
//! 2. **Key uniqueness**: Different chain indices produce different keys
//! 3. **Determinism**: Same chain key always produces the same sequence
//! 4. **Skipping**: advance_to yields exactly the keys sequential steps yield
//! 5. **Tamper detection**: Any single flipped byte fails with one opaque error

use murmur_crypto::{
    ChainKey, CryptoError, MessageKey, NONCE_SIZE, RustCryptoPrimitives, SkippedKeys,
    SymmetricKey, TAG_SIZE,
};
use proptest::prelude::*;

fn seed_strategy() -> impl Strategy<Value = [u8; 32]> {
    prop::collection::vec(any::<u8>(), 32..=32).prop_map(|v| {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&v);
        arr
    })
}

fn chain_from(seed: [u8; 32]) -> ChainKey {
    ChainKey::new(SymmetricKey::from_bytes(seed), 0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_seal_open_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..1000),
        associated_data in prop::collection::vec(any::<u8>(), 0..64),
        seed in seed_strategy(),
        rng_seed in seed_strategy(),
    ) {
        let primitives = RustCryptoPrimitives::from_seed(rng_seed);
        let key = chain_from(seed).message_key(&primitives).unwrap();

        let sealed = key.seal(&primitives, &plaintext, &associated_data).unwrap();
        prop_assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let opened = key.open(&primitives, &sealed, &associated_data).unwrap();
        prop_assert_eq!(opened, plaintext);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_chain_keys_unique(
        seed in seed_strategy(),
        num_keys in 2usize..20,
    ) {
        let primitives = RustCryptoPrimitives::from_seed([0u8; 32]);
        let mut chain = chain_from(seed);
        let keys: Vec<MessageKey> =
            (0..num_keys).map(|_| chain.step(&primitives).unwrap()).collect();

        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                prop_assert_ne!(
                    keys[i].key(),
                    keys[j].key(),
                    "keys at index {} and {} must be different",
                    keys[i].index(),
                    keys[j].index()
                );
            }
        }
    }

    #[test]
    fn prop_chain_deterministic(
        seed in seed_strategy(),
        num_steps in 1usize..10,
    ) {
        // Generator state must not influence derivation
        let p1 = RustCryptoPrimitives::from_seed([1u8; 32]);
        let p2 = RustCryptoPrimitives::from_seed([2u8; 32]);
        let mut chain1 = chain_from(seed);
        let mut chain2 = chain_from(seed);

        for _ in 0..num_steps {
            let key1 = chain1.step(&p1).unwrap();
            let key2 = chain2.step(&p2).unwrap();

            prop_assert_eq!(key1.key(), key2.key());
            prop_assert_eq!(key1.index(), key2.index());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn prop_advance_to_matches_sequential(
        seed in seed_strategy(),
        target in 0u32..50,
    ) {
        let primitives = RustCryptoPrimitives::from_seed([0u8; 32]);

        let mut sequential = chain_from(seed);
        let mut expected = Vec::new();
        for _ in 0..=target {
            expected.push(sequential.step(&primitives).unwrap());
        }

        let mut skipping = chain_from(seed);
        let (skipped, key) = skipping.advance_to(&primitives, target, 1000).unwrap();

        prop_assert_eq!(skipped.len(), target as usize);
        prop_assert_eq!(&skipped[..], &expected[..target as usize]);
        prop_assert_eq!(&key, &expected[target as usize]);
        prop_assert_eq!(skipping, sequential);
    }

    #[test]
    fn prop_skipped_cache_respects_bound(
        max_skip in 1u32..64,
        first in 0u32..64,
        second in 0u32..64,
    ) {
        let primitives = RustCryptoPrimitives::from_seed([0u8; 32]);
        let mut chain = chain_from([9u8; 32]);
        let mut cache: SkippedKeys<u8> = SkippedKeys::new();

        for target in [chain.index() + first, chain.index() + first + 1 + second] {
            let gap = target - chain.index();
            if cache.check_capacity(&0, gap, max_skip).is_err() {
                continue;
            }
            let Ok((skipped, _)) = chain.advance_to(&primitives, target, max_skip) else {
                continue;
            };
            cache.insert_all(&0, skipped);
        }

        prop_assert!(cache.count_for(&0) <= max_skip as usize);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_any_flipped_byte_fails_opaquely(
        plaintext in prop::collection::vec(any::<u8>(), 1..200),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let primitives = RustCryptoPrimitives::from_seed([4u8; 32]);
        let key = chain_from([6u8; 32]).message_key(&primitives).unwrap();

        let mut sealed = key.seal(&primitives, &plaintext, b"ad").unwrap();
        let index = position.index(sealed.len());
        sealed[index] ^= 1 << bit;

        prop_assert_eq!(
            key.open(&primitives, &sealed, b"ad").unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }
}
