//! Fault-injecting storage for recovery tests.
//!
//! Storage wrapper that fails operations to test error handling and recovery.
//! Failures are either random (seeded, reproducible) or targeted at atomic
//! batches, which is where multi-step operations such as key rotation commit.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use super::{SecureStorage, StorageError, WriteOp};

/// Chaotic storage wrapper that injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// based on a configured failure rate. A failed operation never reaches the
/// inner storage, so a failed `apply` leaves it untouched.
#[derive(Clone)]
pub struct ChaoticStorage<S: SecureStorage> {
    inner: S,
    /// Share of operations that fail, within [0.0, 1.0]
    failure_rate: f64,
    /// Which operations fail, reproducible from the seed
    schedule: Arc<Mutex<FaultSchedule>>,
    /// When set, every `apply` fails regardless of the failure rate
    fail_batches: Arc<AtomicBool>,
    /// Operation counter
    operation_count: Arc<AtomicUsize>,
}

/// Seeded failure schedule.
///
/// SplitMix64 stream: every seed, zero included, yields a full-period
/// sequence, so a seed fully determines which operations fail.
struct FaultSchedule {
    counter: u64,
}

impl FaultSchedule {
    const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

    fn seeded(seed: u64) -> Self {
        Self { counter: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(Self::GOLDEN_GAMMA);
        let mut z = self.counter;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Draw the next operation's fate: fails with probability `rate`.
    fn fails(&mut self, rate: f64) -> bool {
        let high = u32::try_from(self.next_u64() >> 32).unwrap_or(u32::MAX);
        f64::from(high) / 4_294_967_296.0 < rate
    }
}

impl<S: SecureStorage> ChaoticStorage<S> {
    /// Wrap `inner`, failing `failure_rate` of operations on a fixed schedule.
    ///
    /// # Panics
    ///
    /// Panics unless `failure_rate` lies in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x6D75_726D_7572)
    }

    /// Like [`new`](Self::new), with the failure schedule derived from `seed`.
    ///
    /// # Panics
    ///
    /// Panics unless `failure_rate` lies in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure rate {failure_rate} outside [0.0, 1.0]"
        );

        Self {
            inner,
            failure_rate,
            schedule: Arc::new(Mutex::new(FaultSchedule::seeded(seed))),
            fail_batches: Arc::new(AtomicBool::new(false)),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every subsequent `apply` fail (or stop failing).
    ///
    /// Simulates a crash at the commit point of a multi-step operation.
    pub fn fail_atomic_batches(&self, enabled: bool) {
        self.fail_batches.store(enabled, Ordering::SeqCst);
    }

    /// Wrapped storage, bypassing injection.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Operations attempted so far, failed ones included.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Count the operation and decide whether it fails.
    fn inject(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);

        let fail = match self.schedule.lock() {
            Ok(mut schedule) => schedule.fails(self.failure_rate),
            Err(_) => true,
        };
        if fail {
            return Err(StorageError::Io("injected storage failure".to_string()));
        }
        Ok(())
    }
}

impl<S: SecureStorage> SecureStorage for ChaoticStorage<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inject()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete(key)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inject()?;
        self.inner.list_keys(prefix)
    }

    fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        self.inject()?;
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected batch failure".to_string()));
        }
        self.inner.apply(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn zero_rate_never_fails() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);

        for i in 0..100 {
            storage.set(&format!("k{i}"), b"v").unwrap();
        }
        assert_eq!(storage.inner().len(), 100);
        assert_eq!(storage.operation_count(), 100);
    }

    #[test]
    fn full_rate_always_fails_without_touching_inner() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);

        assert!(storage.set("k", b"v").is_err());
        assert!(storage.inner().is_empty());
    }

    #[test]
    fn same_seed_same_failures() {
        let run = |seed| {
            let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (0..50).map(|i| storage.set(&format!("k{i}"), b"v").is_ok()).collect::<Vec<_>>()
        };

        assert_eq!(run(42), run(42));
    }

    #[test]
    fn failure_rate_is_honoured() {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.3, 0);

        let failures = (0..1000).filter(|i| storage.set(&format!("k{i}"), b"v").is_err()).count();

        assert!((200..400).contains(&failures), "{failures} failures at rate 0.3");
        assert_eq!(storage.inner().len(), 1000 - failures);
    }

    #[test]
    fn seeds_give_different_schedules() {
        let run = |seed| {
            let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (0..64).map(|i| storage.set(&format!("k{i}"), b"v").is_ok()).collect::<Vec<_>>()
        };

        assert_ne!(run(1), run(2));
    }

    #[test]
    fn failed_batch_leaves_inner_unchanged() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        storage.set("keep", b"1").unwrap();
        storage.fail_atomic_batches(true);

        let result = storage.apply(&[
            WriteOp::Put { key: "new".to_string(), value: b"2".to_vec() },
            WriteOp::Delete { key: "keep".to_string() },
        ]);

        assert!(result.unwrap_err().is_transient());
        assert_eq!(storage.inner().get("keep").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.inner().get("new").unwrap(), None);

        // Single writes still go through
        storage.set("single", b"3").unwrap();
    }
}
