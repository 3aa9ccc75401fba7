//! Safety numbers.
//!
//! A 60-digit number both parties compare out of band to confirm they see
//! the same identity keys. Each party contributes 30 digits derived from its
//! own key and id by iterated SHA-512; the two halves are sorted, so both
//! sides display the same number.

use std::fmt;

use sha2::{Digest, Sha512};

use crate::keystore::IdentityKey;

/// Fingerprint format version, hashed into every half.
const FINGERPRINT_VERSION: [u8; 2] = [0, 1];

/// SHA-512 iterations per half.
const ITERATIONS: usize = 5200;

/// Digits contributed by one party.
const HALF_DIGITS: usize = 30;

/// Both parties' identities rendered as 60 decimal digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SafetyNumber {
    digits: String,
}

impl SafetyNumber {
    /// Derive the safety number for a conversation. Argument order between
    /// local and remote does not matter.
    pub fn new(local_id: &str, local: &IdentityKey, remote_id: &str, remote: &IdentityKey) -> Self {
        let mut halves = [half(local_id, local), half(remote_id, remote)];
        halves.sort();
        Self { digits: halves.concat() }
    }

    /// The 60 digits without separators.
    pub fn as_str(&self) -> &str {
        &self.digits
    }

    /// Compare against a number typed or scanned by the user, ignoring
    /// whitespace.
    pub fn matches(&self, candidate: &str) -> bool {
        let cleaned: String = candidate.chars().filter(|c| !c.is_whitespace()).collect();
        cleaned == self.digits
    }
}

/// Groups of five digits separated by spaces.
impl fmt::Display for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.digits.as_bytes().chunks(5).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(std::str::from_utf8(group).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

fn half(id: &str, identity: &IdentityKey) -> String {
    let key = identity.to_bytes();

    let mut hash = Sha512::new()
        .chain_update(FINGERPRINT_VERSION)
        .chain_update(key)
        .chain_update(id.as_bytes())
        .finalize();
    for _ in 0..ITERATIONS {
        hash = Sha512::new().chain_update(hash).chain_update(key).finalize();
    }

    let mut digits = String::with_capacity(HALF_DIGITS);
    for chunk in hash[..HALF_DIGITS].chunks(5) {
        let value = chunk.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        digits.push_str(&format!("{:05}", value % 100_000));
    }
    digits
}
