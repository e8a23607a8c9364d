//! Keeps the local etcd member in step with the node's swarm role.
//!
//! Swarm managers run an etcd member; workers only talk to the managers'
//! members. The leader of a fresh swarm bootstraps a one-member cluster,
//! other managers join it, and a role poller follows promotions and
//! demotions afterwards.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vdvs_core::error::{Result, VdvsError};
use vdvs_core::runtime::{NodeRole, Orchestrator};

use crate::process::{
    ports_from_env, ClusterState, KvProcess, MemberSpec, DEFAULT_DATA_DIR,
};

/// An etcd cluster member as reported by the member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    /// Empty until the member has started.
    pub name: String,
    pub peer_urls: Vec<String>,
}

impl Member {
    fn first_peer_url(&self) -> Option<&str> {
        self.peer_urls.first().map(String::as_str)
    }
}

/// Membership administration against a given client endpoint.
#[async_trait]
pub trait Membership: Send + Sync {
    async fn members(&self, endpoint: &str) -> Result<Vec<Member>>;

    /// Adds a member and returns the resulting member list.
    async fn add_member(&self, endpoint: &str, peer_url: &str) -> Result<Vec<Member>>;

    async fn remove_member(&self, endpoint: &str, id: u64) -> Result<()>;

    /// Succeeds once the endpoint answers requests.
    async fn check_endpoint(&self, endpoint: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub data_dir: PathBuf,
    pub client_port: u16,
    pub peer_port: u16,
    pub check_tick: Duration,
    pub check_timeout: Duration,
    pub role_poll: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            client_port: crate::process::DEFAULT_CLIENT_PORT,
            peer_port: crate::process::DEFAULT_PEER_PORT,
            check_tick: Duration::from_secs(1),
            check_timeout: Duration::from_secs(10),
            role_poll: Duration::from_secs(15),
        }
    }
}

impl ClusterSettings {
    pub fn from_env(env: impl Fn(&str) -> Option<String>) -> Self {
        let (client_port, peer_port) = ports_from_env(env);
        Self {
            client_port,
            peer_port,
            ..Default::default()
        }
    }
}

/// Host part of a `host:port` address.
pub fn host_of(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

/// Lifecycle of the local member.
pub struct KvCluster {
    orchestrator: Arc<dyn Orchestrator>,
    membership: Arc<dyn Membership>,
    process: Arc<dyn KvProcess>,
    settings: ClusterSettings,
    node_id: String,
    node_addr: String,
    is_manager: AtomicBool,
    /// Serializes bootstrap and role transitions.
    transition: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    /// `Some(n)` while the local member is serving, bumped on every
    /// (re)start so watchers know to reconnect.
    local: watch::Sender<Option<u64>>,
    last_error: Mutex<Option<String>>,
}

impl KvCluster {
    /// Reads the node's role and starts, joins or restarts the local
    /// member accordingly. Workers start nothing.
    pub async fn bootstrap(
        orchestrator: Arc<dyn Orchestrator>,
        membership: Arc<dyn Membership>,
        process: Arc<dyn KvProcess>,
        settings: ClusterSettings,
    ) -> Result<Arc<Self>> {
        let (info, role) = orchestrator.node_role().await.map_err(|e| {
            error!(error = %e, "Failed to get swarm Info from docker client");
            e
        })?;
        let (local, _) = watch::channel(None);
        let cluster = Arc::new(Self {
            orchestrator,
            membership,
            process,
            settings,
            node_id: info.node_id,
            node_addr: info.node_addr,
            is_manager: AtomicBool::new(role.is_manager()),
            transition: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            local,
            last_error: Mutex::new(None),
        });

        let _transition = cluster.transition.lock().await;
        if role == NodeRole::Worker {
            info!(node_id = %cluster.node_id, "Swarm node role: worker, not running an etcd member");
            return Ok(cluster.clone());
        }

        match tokio::fs::metadata(&cluster.settings.data_dir).await {
            Ok(_) => {
                info!("ETCD data-dir exists, continue to rejoin");
                cluster.rejoin().await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("ETCD data-dir does not exist, continue to create/join a new ETCD cluster");
                if role == NodeRole::Leader {
                    info!(node_id = %cluster.node_id, "Swarm node role: leader, start ETCD cluster");
                    cluster.start_new().await?;
                } else {
                    cluster.join().await?;
                }
            }
            Err(e) => {
                error!(error = %e, "failed to stat ETCD data-dir");
                return Err(e.into());
            }
        }
        drop(_transition);
        Ok(cluster)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_addr(&self) -> &str {
        &self.node_addr
    }

    pub fn is_manager(&self) -> bool {
        self.is_manager.load(Ordering::Acquire)
    }

    pub fn data_dir(&self) -> &Path {
        &self.settings.data_dir
    }

    /// Follows the local member: `Some(generation)` while it serves.
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.local.subscribe()
    }

    /// Last role transition failure, if the most recent one failed.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn member_spec(&self) -> MemberSpec {
        MemberSpec {
            name: self.node_id.clone(),
            addr: self.node_addr.clone(),
            data_dir: self.settings.data_dir.clone(),
            client_port: self.settings.client_port,
            peer_port: self.settings.peer_port,
        }
    }

    fn endpoint(&self, addr: &str) -> String {
        format!("{}:{}", host_of(addr), self.settings.client_port)
    }

    async fn rejoin(&self) -> Result<()> {
        info!(node_id = %self.node_id, node_addr = %self.node_addr, "rejoining ETCD cluster");
        let spec = self.member_spec();
        self.process.start(spec.args(&ClusterState::Restart)).await?;
        self.check_local().await
    }

    async fn start_new(&self) -> Result<()> {
        info!(node_id = %self.node_id, node_addr = %self.node_addr, "starting ETCD cluster");
        tokio::fs::create_dir_all(&self.settings.data_dir).await.map_err(|e| {
            error!(error = %e, "Failed to create directory etcd-data");
            VdvsError::Io(e)
        })?;
        let spec = self.member_spec();
        self.process.start(spec.args(&ClusterState::New)).await?;
        self.check_local().await
    }

    async fn join(&self) -> Result<()> {
        info!(node_id = %self.node_id, node_addr = %self.node_addr, "joining ETCD cluster");
        let leader = self.orchestrator.leader_addr().await.map_err(|e| {
            error!(error = %e, "Failed to get swarm leader address");
            e
        })?;
        let endpoint = self.endpoint(&leader);
        let spec = self.member_spec();
        let peer_url = spec.peer_url();

        let members = self.membership.members(&endpoint).await?;
        let mut registered = false;
        if let Some(member) = members
            .iter()
            .find(|m| m.first_peer_url() == Some(peer_url.as_str()))
        {
            if member.name.is_empty() {
                info!(%peer_url, "Already joined as ETCD member but not started");
                registered = true;
            } else {
                info!(%peer_url, "Already joined as a ETCD member and started, removing self before re-join");
                self.membership.remove_member(&endpoint, member.id).await?;
            }
        }

        let members = if registered {
            members
        } else {
            self.membership.add_member(&endpoint, &peer_url).await?
        };
        let initial: Vec<String> = members
            .iter()
            .filter(|m| !m.name.is_empty())
            .filter_map(|m| m.first_peer_url().map(|u| format!("{}={}", m.name, u)))
            .collect();

        tokio::fs::create_dir_all(&self.settings.data_dir).await?;
        self.process
            .start(spec.args(&ClusterState::Existing(initial.join(","))))
            .await?;
        self.check_local().await
    }

    async fn leave(&self) -> Result<()> {
        let endpoint = self.endpoint(&self.node_addr);
        let peer_url = self.member_spec().peer_url();
        let members = self.membership.members(&endpoint).await?;
        if let Some(member) = members
            .iter()
            .find(|m| m.first_peer_url() == Some(peer_url.as_str()))
        {
            info!(%peer_url, "Remove self from ETCD member due to demotion");
            self.membership.remove_member(&endpoint, member.id).await?;
        }
        self.stop_local().await
    }

    async fn stop_local(&self) -> Result<()> {
        self.local.send_replace(None);
        self.process.stop().await?;
        match tokio::fs::remove_dir_all(&self.settings.data_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(error = %e, "Failed to remove ETCD data directory");
                return Err(e.into());
            }
        }
        info!("Stopped ETCD service due to demotion");
        Ok(())
    }

    /// Polls the local endpoint until it answers, then announces it.
    async fn check_local(&self) -> Result<()> {
        let endpoint = self.endpoint(&self.node_addr);
        let mut tick = tokio::time::interval(self.settings.check_tick);
        let deadline = tokio::time::sleep(self.settings.check_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!(%endpoint, "Checking ETCD client is started");
                    match self.membership.check_endpoint(&endpoint).await {
                        Ok(()) => {
                            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                            info!(generation, "Local ETCD client is up successfully, start watcher");
                            self.local.send_replace(Some(generation));
                            return Ok(());
                        }
                        Err(e) => warn!(%endpoint, error = %e, "Failed to get ETCD client, retry before timeout"),
                    }
                }
                _ = &mut deadline => {
                    return Err(VdvsError::Timeout(
                        "Timeout reached; ETCD cluster is not started".to_string(),
                    ));
                }
            }
        }
    }

    /// Joins on promotion, leaves on demotion. Repeated calls are no-ops.
    pub async fn role_check(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let info = self.orchestrator.swarm_info().await?;
        let was_manager = self.is_manager();
        let result = match (info.is_manager, was_manager) {
            (true, false) => {
                info!("Node is promoted to manager, prepare to join ETCD cluster");
                self.join().await.map(|_| true)
            }
            (false, true) => {
                info!("Node is demoted from manager to worker, prepare to leave ETCD cluster");
                self.leave().await.map(|_| false)
            }
            _ => Ok(was_manager),
        };
        match result {
            Ok(now_manager) => {
                self.is_manager.store(now_manager, Ordering::Release);
                *self.last_error.lock() = None;
                Ok(())
            }
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Failed role transition");
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Runs [`KvCluster::role_check`] on every poll tick until cancelled.
    pub async fn run_role_poller(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.settings.role_poll);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("role poller stopped");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.role_check().await {
                        warn!(error = %e, "Failed to do role check");
                    }
                }
            }
        }
    }

    /// Stops the local member without leaving the cluster.
    pub async fn shutdown(&self) -> Result<()> {
        self.local.send_replace(None);
        self.process.stop().await
    }
}
