//! In-process backend with etcd's transaction and watch semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use vdvs_core::error::{Result, VdvsError};

use crate::backend::{Cmp, KvBackend, Op, TxnResult, WatchEvent, WatchKind, WatchStream, WATCH_BUFFER};

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, String>,
    watchers: Vec<(String, mpsc::Sender<WatchEvent>)>,
    /// Key prefixes whose next transaction fails.
    failures: Vec<String>,
}

/// Shared in-memory store. Clones of an `Arc<MemoryBackend>` behave like
/// clients of one cluster.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    locks: Mutex<HashMap<String, u64>>,
    released: Notify,
    next_token: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next transaction touching a key under `prefix` fail.
    pub fn fail_next(&self, prefix: &str) {
        self.inner.lock().failures.push(prefix.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().data.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().data.keys().cloned().collect()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks.lock().contains_key(name)
    }

    fn try_acquire(&self, name: &str) -> Option<Vec<u8>> {
        let mut locks = self.locks.lock();
        if locks.contains_key(name) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        locks.insert(name.to_string(), token);
        Some(format!("{}/{:x}", name, token).into_bytes())
    }
}

fn holds(data: &BTreeMap<String, String>, cmp: &Cmp) -> bool {
    match cmp {
        Cmp::Equal(k, v) => data.get(k) == Some(v),
        Cmp::NotEqual(k, v) => data.get(k) != Some(v),
        Cmp::Missing(k) => !data.contains_key(k),
    }
}

fn op_key(op: &Op) -> &str {
    match op {
        Op::Put(k, _) | Op::Get(k) | Op::Delete(k) | Op::DeletePrefix(k) => k,
    }
}

impl Inner {
    fn publish(&mut self, event: WatchEvent) {
        self.watchers.retain(|(prefix, tx)| {
            if !event.key.starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(key = %event.key, "watch buffer full, dropping watcher");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn delete(&mut self, key: String) {
        if let Some(prev) = self.data.remove(&key) {
            self.publish(WatchEvent {
                kind: WatchKind::Delete,
                key,
                value: None,
                prev_value: Some(prev),
            });
        }
    }

    fn apply(&mut self, ops: Vec<Op>) -> Vec<Option<String>> {
        let mut values = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                Op::Get(key) => values.push(self.data.get(&key).cloned()),
                Op::Put(key, value) => {
                    let prev = self.data.insert(key.clone(), value.clone());
                    self.publish(WatchEvent {
                        kind: WatchKind::Put,
                        key,
                        value: Some(value),
                        prev_value: prev,
                    });
                    values.push(None);
                }
                Op::Delete(key) => {
                    self.delete(key);
                    values.push(None);
                }
                Op::DeletePrefix(prefix) => {
                    let keys: Vec<String> = self
                        .data
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in keys {
                        self.delete(key);
                    }
                    values.push(None);
                }
            }
        }
        values
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn txn(&self, when: Vec<Cmp>, then: Vec<Op>, otherwise: Vec<Op>) -> Result<TxnResult> {
        let mut inner = self.inner.lock();
        if !inner.failures.is_empty() {
            let hit = inner.failures.iter().position(|prefix| {
                then.iter()
                    .chain(otherwise.iter())
                    .any(|op| op_key(op).starts_with(prefix.as_str()))
            });
            if let Some(i) = hit {
                let prefix = inner.failures.remove(i);
                return Err(VdvsError::Transport(format!(
                    "injected failure for {}",
                    prefix
                )));
            }
        }
        let succeeded = when.iter().all(|c| holds(&inner.data, c));
        let ops = if succeeded { then } else { otherwise };
        debug!(succeeded, ops = ops.len(), "memory txn");
        let values = inner.apply(ops);
        Ok(TxnResult { succeeded, values })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.inner.lock().watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }

    async fn lock(&self, name: &str, _ttl_secs: i64) -> Result<Vec<u8>> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(key) = self.try_acquire(name) {
                return Ok(key);
            }
            notified.await;
        }
    }

    async fn unlock(&self, key: Vec<u8>) -> Result<()> {
        let key = String::from_utf8_lossy(&key).into_owned();
        let Some((name, token)) = key.rsplit_once('/') else {
            return Err(VdvsError::InvalidArgument(format!("bad lock key {}", key)));
        };
        let mut locks = self.locks.lock();
        match locks.get(name) {
            Some(held) if format!("{:x}", held) == token => {
                locks.remove(name);
                drop(locks);
                self.released.notify_waiters();
                Ok(())
            }
            _ => Err(VdvsError::NotFound(format!("lock {} is not held", key))),
        }
    }
}
