//! Key-distribution collaborator.
//!
//! The directory that stores published prekey bundles. It is the only
//! asynchronous edge of the core: fetching a peer's bundle may suspend, the
//! cryptographic state transitions that follow never do.
//!
//! Bundles expire server-side, so [`DistributionError::NotFound`] is a normal,
//! retryable outcome.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{error::DistributionError, keystore::PreKeyBundle};

/// Prekey bundle directory.
///
/// Implementations must be cheap to clone and safe to share across tasks.
pub trait KeyDistribution: Clone + Send + Sync + 'static {
    /// Publish `bundle` as the current bundle of `owner`.
    ///
    /// # Errors
    ///
    /// [`DistributionError::Unavailable`] if the directory cannot be reached.
    fn upload_pre_key_bundle(
        &self,
        owner: &str,
        bundle: PreKeyBundle,
    ) -> impl Future<Output = Result<(), DistributionError>> + Send;

    /// Fetch the current bundle of `peer`.
    ///
    /// # Errors
    ///
    /// [`DistributionError::NotFound`] if nothing is published for `peer`.
    fn fetch_pre_key_bundle(
        &self,
        peer: &str,
    ) -> impl Future<Output = Result<PreKeyBundle, DistributionError>> + Send;
}

/// In-process directory.
///
/// Hands out each published one-time prekey at most once: after a fetch the
/// stored bundle keeps only its signed prekey until the owner uploads again.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    bundles: Arc<Mutex<HashMap<String, PreKeyBundle>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the directory being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remove the bundle of `owner`, as if it expired.
    pub async fn expire(&self, owner: &str) {
        self.bundles.lock().await.remove(owner);
    }

    fn check_online(&self) -> Result<(), DistributionError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DistributionError::Unavailable("directory offline".to_string()));
        }
        Ok(())
    }
}

impl KeyDistribution for MemoryDirectory {
    async fn upload_pre_key_bundle(
        &self,
        owner: &str,
        bundle: PreKeyBundle,
    ) -> Result<(), DistributionError> {
        self.check_online()?;
        debug!(
            owner,
            signed_pre_key_id = bundle.signed_pre_key_id,
            one_time = bundle.one_time_pre_key.is_some(),
            "bundle uploaded"
        );
        self.bundles.lock().await.insert(owner.to_string(), bundle);
        Ok(())
    }

    async fn fetch_pre_key_bundle(&self, peer: &str) -> Result<PreKeyBundle, DistributionError> {
        self.check_online()?;
        let mut bundles = self.bundles.lock().await;
        let stored = bundles
            .get_mut(peer)
            .ok_or_else(|| DistributionError::NotFound { peer: peer.to_string() })?;


        let bundle = stored.clone();
        stored.one_time_pre_key = None;
        Ok(bundle)
    }
}
