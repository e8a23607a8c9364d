//! Metadata operations on top of a [`KvBackend`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use vdvs_core::error::{Result, VdvsError};

use crate::backend::{Cmp, KvBackend, Op, TxnResult};

/// Returned by [`KvStore::read_batch`] when none of the keys exist.
pub const VOLUME_DOES_NOT_EXIST: &str = "No such volume";

/// Appended to errors caused by a missed transaction deadline.
pub const UNHEALTHY_HINT: &str = "ETCD maybe unhealthy";

/// How long a file-share server may take to come up.
pub const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Key prefixes holding per-volume metadata.
pub const PREFIX_STATE: &str = "state/";
pub const PREFIX_GREF: &str = "gref/";
pub const PREFIX_INFO: &str = "info/";
pub const PREFIX_CLIENT: &str = "client/";

/// Spin and deadline settings for the blocking operations.
#[derive(Debug, Clone, Copy)]
pub struct KvTimings {
    /// Pause between attempts of a spinning operation.
    pub tick: Duration,
    /// Deadline of `atomic_incr` and `atomic_decr`.
    pub update_timeout: Duration,
    pub service_start_timeout: Duration,
    /// Extra time a lock waiter gets on top of the service start timeout.
    pub lock_timeout: Duration,
    pub lease_ttl_secs: i64,
}

impl Default for KvTimings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            update_timeout: Duration::from_secs(10),
            service_start_timeout: SERVICE_START_TIMEOUT,
            lock_timeout: Duration::from_secs(20),
            lease_ttl_secs: 20,
        }
    }
}

impl KvTimings {
    pub fn wait_deadline(&self) -> Duration {
        self.service_start_timeout + self.update_timeout
    }

    pub fn lock_deadline(&self) -> Duration {
        self.service_start_timeout + self.lock_timeout
    }
}

/// Volume metadata store.
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
    timings: KvTimings,
}

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            timings: KvTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: KvTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn timings(&self) -> &KvTimings {
        &self.timings
    }

    /// Replaces `old` with `new`. False when the key held something else.
    pub async fn compare_and_put(&self, key: &str, old: &str, new: &str) -> bool {
        debug!(key, old, new, "compare_and_put");
        match self
            .backend
            .txn(vec![Cmp::equal(key, old)], vec![Op::put(key, new)], vec![])
            .await
        {
            Ok(r) => r.succeeded,
            Err(e) => {
                warn!(key, old, new, error = %e, "Failed to compare and put");
                false
            }
        }
    }

    /// Like [`KvStore::compare_and_put`], but on a mismatch reads the
    /// current value in the same transaction.
    pub async fn compare_and_put_or_get(
        &self,
        key: &str,
        old: &str,
        new: &str,
    ) -> Result<(bool, Option<String>)> {
        let r = self
            .backend
            .txn(
                vec![Cmp::equal(key, old)],
                vec![Op::put(key, new)],
                vec![Op::get(key)],
            )
            .await?;
        if r.succeeded {
            Ok((true, Some(new.to_string())))
        } else {
            Ok((false, r.value(0).map(str::to_string)))
        }
    }

    /// Writes `new` unless the key already holds it.
    pub async fn put_if_not_equal(&self, key: &str, new: &str) -> Result<bool> {
        let r = self
            .backend
            .txn(vec![Cmp::not_equal(key, new)], vec![Op::put(key, new)], vec![])
            .await?;
        Ok(r.succeeded)
    }

    /// Suffixes of every key under `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .backend
            .get_prefix(prefix)
            .await?
            .into_iter()
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect())
    }

    /// Full key to value for every key under `prefix`.
    pub async fn kv_map(&self, prefix: &str) -> Result<HashMap<String, String>> {
        Ok(self.backend.get_prefix(prefix).await?.into_iter().collect())
    }

    /// Writes every pair in one transaction.
    pub async fn write_batch(&self, pairs: &[(String, String)]) -> Result<()> {
        debug!(?pairs, "write_batch");
        let ops = pairs
            .iter()
            .map(|(k, v)| Op::put(k.as_str(), v.as_str()))
            .collect();
        self.backend.txn(vec![], ops, vec![]).await.map_err(|e| {
            let e = annotate("Failed to write metadata", e);
            warn!("{}", e);
            e
        })?;
        Ok(())
    }

    /// Runs `ops` unconditionally and returns what the gets read.
    pub async fn update_batch(&self, ops: Vec<Op>) -> Result<TxnResult> {
        debug!(?ops, "update_batch");
        self.backend.txn(vec![], ops, vec![]).await.map_err(|e| {
            let e = annotate("Transactional metadata update failed", e);
            warn!("{}", e);
            e
        })
    }

    /// Reads every key in one transaction, in order.
    pub async fn read_batch(&self, keys: &[String]) -> Result<Vec<(String, String)>> {
        let ops = keys.iter().map(|k| Op::get(k.as_str())).collect();
        let r = self.backend.txn(vec![], ops, vec![]).await.map_err(|e| {
            let e = annotate("Transactional metadata read failed", e);
            warn!("{}", e);
            e
        })?;
        let found: Vec<(String, String)> = keys
            .iter()
            .enumerate()
            .filter_map(|(i, k)| r.value(i).map(|v| (k.clone(), v.to_string())))
            .collect();
        if found.is_empty() && !keys.is_empty() {
            return Err(VdvsError::NotFound(VOLUME_DOES_NOT_EXIST.to_string()));
        }
        if found.len() != keys.len() {
            let msg = format!(
                "Failed to get volume. Couldn't find all keys! found {} of {}",
                found.len(),
                keys.len()
            );
            warn!("{}", msg);
            return Err(VdvsError::Internal(msg));
        }
        Ok(found)
    }

    /// Deletes every metadata key of a volume, client records included, in
    /// one transaction.
    pub async fn delete_keys_for(&self, name: &str) -> Result<()> {
        debug!(name, "delete_keys_for");
        let ops = [PREFIX_STATE, PREFIX_GREF, PREFIX_INFO]
            .iter()
            .map(|p| Op::delete(format!("{}{}", p, name)))
            .chain(std::iter::once(Op::delete_prefix(format!(
                "{}{}_",
                PREFIX_CLIENT, name
            ))))
            .collect();
        self.backend.txn(vec![], ops, vec![]).await.map_err(|e| {
            let e = annotate(&format!("Failed to delete metadata for volume {}", name), e);
            warn!("{}", e);
            e
        })?;
        Ok(())
    }

    pub async fn atomic_incr(&self, key: &str) -> Result<u64> {
        self.atomic_update(key, "AtomicIncr", |n| Ok(n + 1)).await
    }

    /// Decrements; a value of 0 cannot be decremented.
    pub async fn atomic_decr(&self, key: &str) -> Result<u64> {
        self.atomic_update(key, "AtomicDecr", |n| {
            n.checked_sub(1).ok_or_else(|| {
                VdvsError::InvalidArgument("Cannot decrease a value equal to 0".to_string())
            })
        })
        .await
    }

    async fn atomic_update(
        &self,
        key: &str,
        what: &str,
        step: impl Fn(u64) -> Result<u64>,
    ) -> Result<u64> {
        let mut tick = tokio::time::interval(self.timings.tick);
        let deadline = tokio::time::sleep(self.timings.update_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let r = self.backend.txn(vec![], vec![Op::get(key)], vec![]).await?;
                    let Some(old) = r.value(0) else {
                        return Err(VdvsError::NotFound(format!("{}: no key found for {}", what, key)));
                    };
                    let num: u64 = old.parse().map_err(|_| {
                        warn!(key, value = old, "Counter is not a number");
                        VdvsError::Internal(format!("{}: corrupt counter {} = {:?}", what, key, old))
                    })?;
                    let new = step(num)?;
                    if self.compare_and_put(key, old, &new.to_string()).await {
                        return Ok(new);
                    }
                }
                _ = &mut deadline => {
                    return Err(VdvsError::Timeout(format!("Timeout reached; {} is not complete", what)));
                }
            }
        }
    }

    /// Waits until `key == value`, then returns `other` read in the same
    /// transaction.
    pub async fn blocking_wait_and_get(&self, key: &str, value: &str, other: &str) -> Result<String> {
        debug!(key, value, other, "blocking_wait_and_get");
        let mut tick = tokio::time::interval(self.timings.tick);
        let deadline = tokio::time::sleep(self.timings.wait_deadline());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let r = self
                        .backend
                        .txn(vec![Cmp::equal(key, value)], vec![Op::get(other)], vec![])
                        .await?;
                    if r.succeeded {
                        return r.value(0).map(str::to_string).ok_or_else(|| {
                            VdvsError::NotFound(format!("BlockingWaitAndGet: no key found for {}", other))
                        });
                    }
                }
                _ = &mut deadline => {
                    return Err(VdvsError::Timeout(
                        "Timeout reached; BlockingWait is not complete".to_string(),
                    ));
                }
            }
        }
    }
}

/// Prefixes a KV error with context, flagging missed deadlines.
pub fn annotate(context: &str, err: VdvsError) -> VdvsError {
    match err {
        VdvsError::Timeout(msg) if !msg.contains(UNHEALTHY_HINT) => {
            VdvsError::Timeout(format!("{}: {}. {}", context, msg, UNHEALTHY_HINT))
        }
        VdvsError::Timeout(msg) => VdvsError::Timeout(format!("{}: {}", context, msg)),
        VdvsError::Transport(msg) => VdvsError::Transport(format!("{}: {}", context, msg)),
        other => other,
    }
}
