//! Local store on durable storage.
//!
//! These tests verify critical invariants:
//! - Identity, pinned peers and vault records survive reopening the store
//! - Reopening never regenerates the identity

use murmur_cli::{CliError, LocalStore};
use murmur_core::CoreConfig;

/// INVARIANT: a second process opening the same file sees the same identity
/// and can open records sealed by the first.
#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("murmur.redb");

    let (identity, key_id) = {
        let store = LocalStore::open(&path, CoreConfig::default()).expect("open");
        let identity = store.init().expect("init");
        store.bundle(10).expect("bundle");
        let record = store.seal("alice", b"mapping").expect("seal");
        (identity, record.key_id)
    };

    let store = LocalStore::open(&path, CoreConfig::default()).expect("reopen");
    assert_eq!(store.init().expect("init"), identity);
    assert!(store.one_time_pre_key_count() >= 10);
    assert_eq!(store.open_record("alice").expect("open record"), b"mapping");

    let rotated = store.rotate("alice").expect("rotate");
    assert_ne!(rotated.key_id, key_id);
}

/// INVARIANT: a pinned peer key is still enforced after reopening.
#[test]
fn pinned_identity_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bob_dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("alice.redb");

    let bob =
        LocalStore::open(bob_dir.path().join("bob.redb"), CoreConfig::default()).expect("open bob");
    let bob_key = bob.init().expect("bob identity");
    let other_key = {
        let other = LocalStore::open(bob_dir.path().join("other.redb"), CoreConfig::default())
            .expect("open other");

        other.init().expect("other identity")
    };

    {
        let alice = LocalStore::open(&path, CoreConfig::default()).expect("open");
        alice.init().expect("init");
        alice.safety_number("alice", "bob", &bob_key).expect("pin bob");
    }

    let alice = LocalStore::open(&path, CoreConfig::default()).expect("reopen");
    assert!(matches!(
        alice.safety_number("alice", "bob", &other_key),
        Err(CliError::IdentityChanged { .. })
    ));
    alice.safety_number("alice", "bob", &bob_key).expect("pinned key");
}
