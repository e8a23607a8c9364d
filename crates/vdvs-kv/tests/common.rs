use std::sync::Arc;

use vdvs_kv::{KvStore, MemoryBackend};

/// Stores of several hosts talking to one cluster.
pub struct Cluster {
    pub kv: Arc<MemoryBackend>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            kv: Arc::new(MemoryBackend::new()),
        }
    }

    pub fn host(&self) -> KvStore {
        KvStore::new(self.kv.clone())
    }
}
