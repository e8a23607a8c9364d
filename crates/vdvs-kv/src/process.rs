//! The local etcd member process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use vdvs_core::error::{Result, VdvsError};

pub const ETCD_BINARY: &str = "/bin/etcd";
pub const DEFAULT_DATA_DIR: &str = "/etcd-data";
pub const DEFAULT_CLIENT_PORT: u16 = 2379;
pub const DEFAULT_PEER_PORT: u16 = 2380;
pub const ENV_CLIENT_PORT: &str = "VFILE_ETCD_CLIENT_PORT";
pub const ENV_PEER_PORT: &str = "VFILE_ETCD_PEER_PORT";
pub const CLUSTER_TOKEN: &str = "vfile-etcd-cluster";
pub const LISTEN_ADDR: &str = "0.0.0.0";
pub const SCHEME: &str = "http://";

/// How a member starts relative to the rest of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterState {
    /// Reuse an existing data directory without touching membership.
    Restart,
    /// First member of a fresh cluster.
    New,
    /// Join an existing cluster with the given `name=peerURL` list.
    Existing(String),
}

/// Identity and ports of the local member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSpec {
    pub name: String,
    pub addr: String,
    pub data_dir: PathBuf,
    pub client_port: u16,
    pub peer_port: u16,
}

impl MemberSpec {
    pub fn peer_url(&self) -> String {
        format!("{}{}:{}", SCHEME, self.addr, self.peer_port)
    }

    pub fn client_url(&self) -> String {
        format!("{}{}:{}", SCHEME, self.addr, self.client_port)
    }

    /// `name=peerURL` entry for `--initial-cluster`.
    pub fn cluster_entry(&self) -> String {
        format!("{}={}", self.name, self.peer_url())
    }

    /// Command line for the member process.
    pub fn args(&self, state: &ClusterState) -> Vec<String> {
        let mut args = vec![
            "--name".to_string(),
            self.name.clone(),
            "--data-dir".to_string(),
            self.data_dir.to_string_lossy().into_owned(),
            "--advertise-client-urls".to_string(),
            self.client_url(),
            "--initial-advertise-peer-urls".to_string(),
            self.peer_url(),
            "--listen-client-urls".to_string(),
            format!("{}{}:{}", SCHEME, LISTEN_ADDR, self.client_port),
            "--listen-peer-urls".to_string(),
            format!("{}{}:{}", SCHEME, LISTEN_ADDR, self.peer_port),
        ];
        let (cluster, state) = match state {
            ClusterState::Restart => return args,
            ClusterState::New => (self.cluster_entry(), "new"),
            ClusterState::Existing(members) if members.is_empty() => {
                (self.cluster_entry(), "existing")
            }
            ClusterState::Existing(members) => {
                (format!("{},{}", members, self.cluster_entry()), "existing")
            }
        };
        args.extend([
            "--initial-cluster-token".to_string(),
            CLUSTER_TOKEN.to_string(),
            "--initial-cluster".to_string(),
            cluster,
            "--initial-cluster-state".to_string(),
            state.to_string(),
        ]);
        args
    }
}

/// Client and peer ports, overridable from the environment.
pub fn ports_from_env(env: impl Fn(&str) -> Option<String>) -> (u16, u16) {
    let port = |name: &str, default: u16| match env(name) {
        Some(v) if !v.is_empty() => v.parse().unwrap_or_else(|_| {
            warn!(name, value = %v, default, "invalid port, using default");
            default
        }),
        _ => default,
    };
    let ports = (
        port(ENV_CLIENT_PORT, DEFAULT_CLIENT_PORT),
        port(ENV_PEER_PORT, DEFAULT_PEER_PORT),
    );
    info!(client_port = ports.0, peer_port = ports.1, "etcd ports");
    ports
}

/// Starts and stops the local member.
#[async_trait]
pub trait KvProcess: Send + Sync {
    async fn start(&self, args: Vec<String>) -> Result<()>;

    /// Kills the member. A member that is not running is not an error.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Runs the etcd binary as a child process.
pub struct EtcdProcess {
    binary: PathBuf,
    child: Mutex<Option<Child>>,
}

impl EtcdProcess {
    pub fn new() -> Self {
        Self::with_binary(ETCD_BINARY)
    }

    pub fn with_binary(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            child: Mutex::new(None),
        }
    }
}

impl Default for EtcdProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvProcess for EtcdProcess {
    async fn start(&self, args: Vec<String>) -> Result<()> {
        let child = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(binary = %self.binary.display(), error = %e, "Failed to start ETCD command");
                VdvsError::Internal(format!("Failed to start {}: {}", self.binary.display(), e))
            })?;
        info!(pid = ?child.id(), ?args, "etcd started");
        *self.child.lock() = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let child = self.child.lock().take();
        match child {
            Some(mut child) => {
                child.kill().await.map_err(|e| {
                    warn!(error = %e, "Failed to stop ETCD process");
                    VdvsError::Io(e)
                })?;
                info!("etcd stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.child.lock().is_some()
    }
}
