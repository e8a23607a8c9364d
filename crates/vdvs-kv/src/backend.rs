//! Transactional key-value backend seam.
//!
//! The store, the lock and the cluster watcher only need compare-then-act
//! transactions, prefix reads, prefix watches and leased locks. Production
//! runs them against etcd; tests run them against [`crate::MemoryBackend`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use vdvs_core::error::Result;

/// Guard of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmp {
    /// Key exists and holds exactly this value.
    Equal(String, String),
    /// Key is missing or holds a different value.
    NotEqual(String, String),
    /// Key does not exist.
    Missing(String),
}

impl Cmp {
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Cmp::Equal(key.into(), value.into())
    }

    pub fn not_equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Cmp::NotEqual(key.into(), value.into())
    }

    pub fn missing(key: impl Into<String>) -> Self {
        Cmp::Missing(key.into())
    }
}

/// One operation inside a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put(String, String),
    Get(String),
    Delete(String),
    /// Deletes every key starting with the prefix.
    DeletePrefix(String),
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Op::Put(key.into(), value.into())
    }

    pub fn get(key: impl Into<String>) -> Self {
        Op::Get(key.into())
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete(key.into())
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        Op::DeletePrefix(prefix.into())
    }
}

/// Outcome of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResult {
    /// Whether every guard held and the `then` branch ran.
    pub succeeded: bool,
    /// One slot per op of the branch that ran; `Some` for gets that found
    /// their key.
    pub values: Vec<Option<String>>,
}

impl TxnResult {
    /// Value read by the op at `index`.
    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Put,
    Delete,
}

/// A change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub key: String,
    pub value: Option<String>,
    /// Value before the change; `None` when the key was created.
    pub prev_value: Option<String>,
}

/// Events of one watch; the stream ends when the watch is lost.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

/// Buffer of a watch channel.
pub const WATCH_BUFFER: usize = 256;

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Runs `then` if every guard in `when` holds, `otherwise` if not.
    async fn txn(&self, when: Vec<Cmp>, then: Vec<Op>, otherwise: Vec<Op>) -> Result<TxnResult>;

    /// All pairs whose key starts with `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Streams changes below `prefix`, with previous values.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    /// Blocks until the named lock is held under a lease of `ttl_secs`.
    /// Returns the ownership key to pass to [`KvBackend::unlock`].
    async fn lock(&self, name: &str, ttl_secs: i64) -> Result<Vec<u8>>;

    async fn unlock(&self, key: Vec<u8>) -> Result<()>;
}
