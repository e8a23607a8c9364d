#![warn(missing_docs)]

//! vDVS key-value store
//!
//! Lifecycle of the etcd member that runs on every swarm manager, and the
//! metadata operations the file-volume control plane performs against the
//! cluster: compare-and-put, batched transactions, atomic counters,
//! blocking waits and named locks.

pub mod backend;
pub mod cluster;
pub mod etcd;
pub mod lock;
pub mod memory;
pub mod process;
pub mod store;

pub use backend::{Cmp, KvBackend, Op, TxnResult, WatchEvent, WatchKind, WatchStream};
pub use cluster::{ClusterSettings, KvCluster, Member, Membership};
pub use etcd::EtcdBackend;
pub use lock::KvLock;
pub use memory::MemoryBackend;
pub use process::{ClusterState, EtcdProcess, KvProcess, MemberSpec};
pub use store::{
    annotate, KvStore, KvTimings, PREFIX_CLIENT, PREFIX_GREF, PREFIX_INFO, PREFIX_STATE,
    VOLUME_DOES_NOT_EXIST,
};
