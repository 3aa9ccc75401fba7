//! Configuration for the messaging core.

use serde::{Deserialize, Serialize};

/// Default bound on skipped message keys held per chain.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Default number of receiving chains kept per pairwise session.
pub const DEFAULT_MAX_RECEIVING_CHAINS: usize = 8;

/// Default number of one-time prekeys generated per top-up.
pub const DEFAULT_ONE_TIME_PREKEY_BATCH: u32 = 100;

/// Default signed prekey lifetime before rotation (7 days).
pub const DEFAULT_SIGNED_PREKEY_ROTATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default time a superseded signed prekey is retained (2 days).
pub const DEFAULT_SIGNED_PREKEY_RETENTION_SECS: u64 = 2 * 24 * 60 * 60;

/// Tunables shared by every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum skipped message keys cached per chain. Exceeding it is fatal.
    pub max_skip: u32,

    /// Maximum receiving chains kept per session. The oldest chain and its
    /// skipped keys are dropped when a new one would exceed this.
    pub max_receiving_chains: usize,

    /// One-time prekeys generated when the pool is topped up.
    pub one_time_prekey_batch: u32,

    /// Age after which the signed prekey is replaced.
    pub signed_prekey_rotation_secs: u64,

    /// How long a superseded signed prekey still answers handshakes.
    pub signed_prekey_retention_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            max_receiving_chains: DEFAULT_MAX_RECEIVING_CHAINS,
            one_time_prekey_batch: DEFAULT_ONE_TIME_PREKEY_BATCH,
            signed_prekey_rotation_secs: DEFAULT_SIGNED_PREKEY_ROTATION_SECS,
            signed_prekey_retention_secs: DEFAULT_SIGNED_PREKEY_RETENTION_SECS,
        }
    }
}
