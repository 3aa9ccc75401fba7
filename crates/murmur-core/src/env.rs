//! Environment abstraction for deterministic testing.
//!
//! Decouples key lifetimes from the system clock. Production code uses
//! [`SystemEnv`]; tests drive time explicitly with [`ManualClock`].
//! Randomness is not part of the environment: it comes from the
//! [`CryptoPrimitives`](murmur_crypto::CryptoPrimitives) capability.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Abstract environment providing wall-clock time.
///
/// # Invariants
///
/// - `wall_clock_secs()` is used only for key lifetimes and record
///   timestamps, never for protocol ordering
pub trait Environment: Clone + Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> u64;
}

/// Production environment using the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn wall_clock_secs(&self) -> u64 {
        // A clock set before 1970 reads as the epoch
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    secs: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the clock at `secs`.
    pub fn starting_at(secs: u64) -> Self {
        Self { secs: Arc::new(AtomicU64::new(secs)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Environment for ManualClock {
    fn wall_clock_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}
