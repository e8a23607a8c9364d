//! Named cluster-wide locks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use vdvs_core::error::{Result, VdvsError};

use crate::backend::KvBackend;
use crate::store::{KvStore, KvTimings};

pub const LOCK_TIMEOUT_MSG: &str = "ETCD Lock blocking wait timeout";

/// How long [`KvLock::try_lock`] waits before giving up.
pub const TRY_LOCK_WAIT: Duration = Duration::from_secs(2);

/// Handle on the lock `<key>-lock`. Nothing is held until one of the lock
/// calls succeeds.
pub struct KvLock {
    name: String,
    backend: Arc<dyn KvBackend>,
    timings: KvTimings,
    held: Option<Vec<u8>>,
}

impl KvStore {
    pub fn create_lock(&self, key: &str) -> KvLock {
        KvLock {
            name: format!("{}-lock", key),
            backend: self.backend().clone(),
            timings: *self.timings(),
            held: None,
        }
    }
}

impl KvLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Waits for the lock, retrying every tick until the lock deadline.
    pub async fn blocking_lock_with_lease(&mut self) -> Result<()> {
        debug!(key = %self.name, "BlockingLockWithLease");
        let mut tick = tokio::time::interval(self.timings.tick);
        let deadline = tokio::time::sleep(self.timings.lock_deadline());
        tokio::pin!(deadline);
        let ttl = self.timings.lease_ttl_secs;
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = &mut deadline => {
                    warn!(key = %self.name, "{}", LOCK_TIMEOUT_MSG);
                    return Err(VdvsError::Timeout(LOCK_TIMEOUT_MSG.to_string()));
                }
            }
            let attempt = tokio::select! {
                res = self.backend.lock(&self.name, ttl) => Some(res),
                _ = &mut deadline => None,
            };
            match attempt {
                Some(Ok(key)) => {
                    info!(key = %self.name, "Locked successfully");
                    self.held = Some(key);
                    return Ok(());
                }
                Some(Err(e)) => warn!(key = %self.name, error = %e, "Failed to get lock"),
                None => {
                    warn!(key = %self.name, "{}", LOCK_TIMEOUT_MSG);
                    return Err(VdvsError::Timeout(LOCK_TIMEOUT_MSG.to_string()));
                }
            }
        }
    }

    /// Takes the lock if it frees up within [`TRY_LOCK_WAIT`].
    pub async fn try_lock(&mut self) -> Result<()> {
        let ttl = self.timings.lease_ttl_secs;
        match tokio::time::timeout(TRY_LOCK_WAIT, self.backend.lock(&self.name, ttl)).await {
            Ok(Ok(key)) => {
                info!(key = %self.name, "TryLock successfully");
                self.held = Some(key);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(key = %self.name, error = %e, "Failed to get TryLock");
                Err(e)
            }
            Err(_) => Err(VdvsError::Busy(format!("Failed to get TryLock for key {}", self.name))),
        }
    }

    /// Unlocks; failures are logged and the handle is cleared regardless.
    pub async fn release(&mut self) {
        if let Some(key) = self.held.take() {
            if let Err(e) = self.backend.unlock(key).await {
                warn!(key = %self.name, error = %e, "Failed to release lock, clearing it anyway");
            }
        }
    }

    /// Forgets the lock without unlocking; its lease expires on its own.
    pub fn clear(&mut self) {
        self.held = None;
    }
}

/// A handle dropped while holding the lock, for example by a cancelled
/// request, unlocks in the background. Otherwise the lease keep-alive would
/// hold the lock for as long as the process runs.
impl Drop for KvLock {
    fn drop(&mut self) {
        let Some(key) = self.held.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                handle.spawn(async move {
                    match backend.unlock(key).await {
                        Ok(()) => debug!(key = %name, "released dropped lock"),
                        Err(e) => warn!(key = %name, error = %e, "Failed to release dropped lock"),
                    }
                });
            }
            Err(_) => warn!(key = %name, "Lock dropped outside the runtime, leaving it to its lease"),
        }
    }
}
