//! etcd implementation of [`KvBackend`] and [`Membership`].
//!
//! A client is minted per operation from the managers the orchestrator
//! currently reports, so the store follows manager churn without any
//! cached connection state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, LockOptions, SortOrder,
    SortTarget, Txn, TxnOp, TxnOpResponse, WatchOptions,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vdvs_core::error::{Result, VdvsError};
use vdvs_core::runtime::Orchestrator;

use crate::backend::{Cmp, KvBackend, Op, TxnResult, WatchEvent, WatchKind, WatchStream, WATCH_BUFFER};
use crate::cluster::{host_of, Member, Membership};
use crate::store::UNHEALTHY_HINT;

/// Deadline of every single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub const CLIENT_CREATE_ERROR: &str = "Failed to create etcd client";

/// Runs one etcd request under [`REQUEST_TIMEOUT`].
async fn with_deadline<T>(
    what: &str,
    fut: impl Future<Output = std::result::Result<T, etcd_client::Error>>,
) -> Result<T> {
    match tokio::time::timeout(REQUEST_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(VdvsError::Transport(format!("{}: {}", what, e))),
        Err(_) => Err(VdvsError::Timeout(format!(
            "{}: deadline exceeded. {}",
            what, UNHEALTHY_HINT
        ))),
    }
}

async fn connect(endpoint: &str) -> Result<Client> {
    let options = ConnectOptions::new()
        .with_connect_timeout(REQUEST_TIMEOUT)
        .with_timeout(REQUEST_TIMEOUT);
    with_deadline("connect", Client::connect([endpoint], Some(options))).await
}

fn to_cmp(cmp: Cmp) -> Compare {
    match cmp {
        Cmp::Equal(k, v) => Compare::value(k, CompareOp::Equal, v),
        Cmp::NotEqual(k, v) => Compare::value(k, CompareOp::NotEqual, v),
        Cmp::Missing(k) => Compare::version(k, CompareOp::Equal, 0),
    }
}

fn to_op(op: Op) -> TxnOp {
    match op {
        Op::Put(k, v) => TxnOp::put(k, v, None),
        Op::Get(k) => TxnOp::get(k, None),
        Op::Delete(k) => TxnOp::delete(k, None),
        Op::DeletePrefix(k) => TxnOp::delete(k, Some(DeleteOptions::new().with_prefix())),
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

struct HeldLock {
    lease: i64,
    keepalive: JoinHandle<()>,
}

struct AbortOnDrop(Option<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// etcd cluster reached through the current swarm managers.
pub struct EtcdBackend {
    orchestrator: Arc<dyn Orchestrator>,
    client_port: u16,
    locks: DashMap<Vec<u8>, HeldLock>,
}

impl EtcdBackend {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, client_port: u16) -> Self {
        Self {
            orchestrator,
            client_port,
            locks: DashMap::new(),
        }
    }

    fn endpoint(&self, addr: &str) -> String {
        format!("{}:{}", host_of(addr), self.client_port)
    }

    /// Connects to the first reachable manager.
    async fn client(&self) -> Result<Client> {
        let info = self.orchestrator.swarm_info().await.map_err(|e| {
            error!(error = %e, "Failed to get swarm managers");
            e
        })?;
        for manager in &info.managers {
            match connect(&self.endpoint(manager.host())).await {
                Ok(client) => return Ok(client),
                Err(e) => debug!(addr = %manager.addr, error = %e, "Cannot get etcd client"),
            }
        }
        error!(node_id = %info.node_id, node_addr = %info.node_addr, "Failed to create ETCD client according to manager info");
        Err(VdvsError::Transport(CLIENT_CREATE_ERROR.to_string()))
    }

    /// Prefers the member on this node, which is what watchers follow.
    async fn local_client(&self) -> Result<Client> {
        let info = self.orchestrator.swarm_info().await?;
        match connect(&self.endpoint(&info.node_addr)).await {
            Ok(client) => Ok(client),
            Err(e) => {
                warn!(error = %e, "local etcd endpoint unavailable, using a manager");
                self.client().await
            }
        }
    }
}

fn keep_alive(mut client: Client, lease: i64, ttl_secs: i64) -> JoinHandle<()> {
    let period = Duration::from_secs((ttl_secs.max(3) / 3) as u64);
    tokio::spawn(async move {
        let (mut keeper, mut stream) = match client.lease_keep_alive(lease).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(lease, error = %e, "failed to start lease keep-alive");
                return;
            }
        };
        loop {
            tokio::time::sleep(period).await;
            if let Err(e) = keeper.keep_alive().await {
                warn!(lease, error = %e, "lease keep-alive failed");
                return;
            }
            match stream.message().await {
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    warn!(lease, error = %e, "lease keep-alive stream failed");
                    return;
                }
            }
        }
    })
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn txn(&self, when: Vec<Cmp>, then: Vec<Op>, otherwise: Vec<Op>) -> Result<TxnResult> {
        let mut client = self.client().await?;
        let txn = Txn::new()
            .when(when.into_iter().map(to_cmp).collect::<Vec<_>>())
            .and_then(then.into_iter().map(to_op).collect::<Vec<_>>())
            .or_else(otherwise.into_iter().map(to_op).collect::<Vec<_>>());
        let resp = with_deadline("txn", client.txn(txn)).await?;
        let values = resp
            .op_responses()
            .into_iter()
            .map(|r| match r {
                TxnOpResponse::Get(get) => get.kvs().first().map(|kv| text(kv.value())),
                _ => None,
            })
            .collect();
        Ok(TxnResult {
            succeeded: resp.succeeded(),
            values,
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut client = self.client().await?;
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = with_deadline("get", client.get(prefix, Some(options))).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| (text(kv.key()), text(kv.value())))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.local_client().await?;
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (mut watcher, mut stream) =
            with_deadline("watch", client.watch(prefix, Some(options))).await?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            info!(prefix, "watch started");
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(prefix, error = %e, "watch failed");
                        break;
                    }
                };
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let event = WatchEvent {
                        kind: match ev.event_type() {
                            EventType::Put => WatchKind::Put,
                            EventType::Delete => WatchKind::Delete,
                        },
                        key: text(kv.key()),
                        value: match ev.event_type() {
                            EventType::Put => Some(text(kv.value())),
                            EventType::Delete => None,
                        },
                        prev_value: ev.prev_kv().map(|p| text(p.value())),
                    };
                    if tx.send(event).await.is_err() {
                        let _ = watcher.cancel().await;
                        return;
                    }
                }
            }
            info!(prefix, "watch ended");
        });
        Ok(rx)
    }

    async fn lock(&self, name: &str, ttl_secs: i64) -> Result<Vec<u8>> {
        let mut client = self.client().await?;
        let lease = with_deadline("lease grant", client.lease_grant(ttl_secs, None))
            .await?
            .id();
        // A caller that gives up on the wait drops this future; the guard
        // stops the keep-alive so the lease and its waiter key expire.
        let mut keepalive = AbortOnDrop(Some(keep_alive(client.clone(), lease, ttl_secs)));
        let options = LockOptions::new().with_lease(lease);
        match client.lock(name, Some(options)).await {
            Ok(resp) => {
                let key = resp.key().to_vec();
                if let Some(keepalive) = keepalive.0.take() {
                    self.locks.insert(key.clone(), HeldLock { lease, keepalive });
                }
                Ok(key)
            }
            Err(e) => {
                drop(keepalive);
                let _ = with_deadline("lease revoke", client.lease_revoke(lease)).await;
                Err(VdvsError::Transport(format!("lock {}: {}", name, e)))
            }
        }
    }

    async fn unlock(&self, key: Vec<u8>) -> Result<()> {
        let held = self.locks.remove(&key).map(|(_, h)| h);
        let mut client = self.client().await?;
        let unlocked = with_deadline("unlock", client.unlock(key)).await.map(|_| ());
        if let Some(held) = held {
            held.keepalive.abort();
            if let Err(e) = with_deadline("lease revoke", client.lease_revoke(held.lease)).await {
                warn!(lease = held.lease, error = %e, "failed to revoke lock lease");
            }
        }
        unlocked
    }
}

fn to_member(m: &etcd_client::Member) -> Member {
    Member {
        id: m.id(),
        name: m.name().to_string(),
        peer_urls: m.peer_urls().to_vec(),
    }
}

#[async_trait]
impl Membership for EtcdBackend {
    async fn members(&self, endpoint: &str) -> Result<Vec<Member>> {
        let mut client = connect(endpoint).await?;
        let resp = with_deadline("member list", client.member_list()).await?;
        Ok(resp.members().iter().map(to_member).collect())
    }

    async fn add_member(&self, endpoint: &str, peer_url: &str) -> Result<Vec<Member>> {
        let mut client = connect(endpoint).await?;
        let resp = with_deadline(
            "member add",
            client.member_add(vec![peer_url.to_string()], None),
        )
        .await?;
        Ok(resp.member_list().iter().map(to_member).collect())
    }

    async fn remove_member(&self, endpoint: &str, id: u64) -> Result<()> {
        let mut client = connect(endpoint).await?;
        with_deadline("member remove", client.member_remove(id)).await?;
        Ok(())
    }

    async fn check_endpoint(&self, endpoint: &str) -> Result<()> {
        let mut client = connect(endpoint).await?;
        with_deadline("status", client.status()).await?;
        Ok(())
    }
}
