//! A small swarm: one KV cluster, one service runtime, one manager running
//! the control plane and any number of hosts with their own file driver.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use vdvs_core::device::{DeviceIo, DeviceWatch, ShareMount, VolumeDevSpec};
use vdvs_core::error::{Result, VdvsError};
use vdvs_core::mounts::{MountEntry, MountTable};
use vdvs_core::runtime::{
    ContainerMount, ContainerRuntime, ContainerSummary, Orchestrator, ServiceRuntime, ServiceSpec,
    ServiceStatus, SwarmInfo, SwarmPeer, VolumeRuntime,
};
use vdvs_core::RefCountsMap;
use vdvs_kv::{KvStore, MemoryBackend};
use vdvs_vfile::{Control, DriverTimings, FileDriver, FileServers, ServerTimings};

pub const MOUNT_ROOT: &str = "/mnt/vfile";

/// Services and volumes as the swarm sees them.
#[derive(Default)]
pub struct Swarm {
    services: Mutex<Vec<ServiceStatus>>,
    next: AtomicU32,
    pub volumes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Swarm {
    pub fn services(&self) -> Vec<String> {
        self.services.lock().iter().map(|s| s.name.clone()).collect()
    }

    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.services
            .lock()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.published_port)
    }
}

#[async_trait]
impl ServiceRuntime for Swarm {
    async fn service_create(&self, spec: &ServiceSpec) -> Result<String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("svc{}", n);
        self.services.lock().push(ServiceStatus {
            id: id.clone(),
            name: spec.name.clone(),
            published_port: 30000 + n as u16,
        });
        Ok(id)
    }

    async fn service_list(&self, name_prefix: &str) -> Result<Vec<ServiceStatus>> {
        Ok(self
            .services
            .lock()
            .iter()
            .filter(|s| s.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn task_states(&self, _service_id: &str) -> Result<Vec<String>> {
        Ok(vec!["running".to_string()])
    }

    async fn service_remove(&self, service_id: &str) -> Result<()> {
        self.services.lock().retain(|s| s.id != service_id);
        Ok(())
    }
}

#[async_trait]
impl VolumeRuntime for Swarm {
    async fn volume_create(
        &self,
        _driver: &str,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        self.volumes.lock().insert(name.to_string(), options.clone());
        Ok(())
    }

    async fn volume_remove(&self, name: &str) -> Result<()> {
        // The backing volume stays busy while its server runs.
        if self.port_of(&format!("vFileServer{}", name.trim_start_matches("_vF_"))).is_some() {
            return Err(VdvsError::Busy("volume is in use".into()));
        }
        self.volumes
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VdvsError::NotFound(name.to_string()))
    }

    async fn volume_inspect(&self, name: &str) -> Result<()> {
        if self.volumes.lock().contains_key(name) {
            Ok(())
        } else {
            Err(VdvsError::NotFound(name.to_string()))
        }
    }
}

/// One node's view of the swarm. Every node is a manager; the first one
/// leads.
pub struct Node {
    id: String,
    addr: String,
}

#[async_trait]
impl Orchestrator for Node {
    async fn swarm_info(&self) -> Result<SwarmInfo> {
        Ok(SwarmInfo {
            node_id: self.id.clone(),
            node_addr: self.addr.clone(),
            is_manager: true,
            managers: vec![SwarmPeer {
                node_id: self.id.clone(),
                addr: format!("{}:2377", self.addr),
            }],
        })
    }

    async fn is_leader(&self, _node_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn leader_addr(&self) -> Result<String> {
        Ok(format!("{}:2377", self.addr))
    }
}

struct NoWatch;

#[async_trait]
impl DeviceWatch for NoWatch {
    async fn wait(&mut self, _device: &Path, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// CIFS mounts of one host.
#[derive(Default)]
pub struct ShareMounts {
    mounts: Mutex<Vec<(PathBuf, ShareMount)>>,
}

impl ShareMounts {
    pub fn port_at(&self, mountpoint: &str) -> Option<u16> {
        self.mounts
            .lock()
            .iter()
            .find(|(mp, _)| mp == Path::new(mountpoint))
            .map(|(_, share)| share.port)
    }

    pub fn count(&self) -> usize {
        self.mounts.lock().len()
    }
}

#[async_trait]
impl DeviceIo for ShareMounts {
    fn supported_filesystems(&self) -> Vec<String> {
        vec![]
    }

    async fn mkfs(&self, _fstype: &str, _label: &str, _device: &Path) -> Result<()> {
        Ok(())
    }

    fn mkdir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn mount(&self, _mp: &Path, _fstype: &str, _device: &Path, _ro: bool) -> Result<()> {
        Err(VdvsError::Internal("unexpected block mount".into()))
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        self.mounts.lock().retain(|(mp, _)| mp != mountpoint);
        Ok(())
    }

    async fn mount_share(&self, mountpoint: &Path, share: &ShareMount) -> Result<()> {
        self.mounts.lock().push((mountpoint.to_path_buf(), share.clone()));
        Ok(())
    }

    fn device_path(&self, _spec: &VolumeDevSpec) -> Result<PathBuf> {
        Err(VdvsError::Internal("no block devices".into()))
    }

    fn prepare_watch(&self) -> Result<Box<dyn DeviceWatch>> {
        Ok(Box::new(NoWatch))
    }

    async fn delete_device_path(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

impl MountTable for ShareMounts {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        Ok(self
            .mounts
            .lock()
            .iter()
            .map(|(mp, share)| MountEntry {
                device: share.source(),
                target: mp.clone(),
                fstype: "cifs".to_string(),
                options: String::new(),
            })
            .collect())
    }
}

struct NoContainers;

#[async_trait]
impl ContainerRuntime for NoContainers {
    async fn active_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(vec![])
    }

    async fn container_mounts(&self, _id: &str) -> Result<Vec<ContainerMount>> {
        Ok(vec![])
    }
}

pub struct Host {
    pub driver: FileDriver,
    pub shares: Arc<ShareMounts>,
}

pub struct Cluster {
    pub kv: Arc<MemoryBackend>,
    pub swarm: Arc<Swarm>,
    ready: watch::Sender<Option<u64>>,
    cancel: CancellationToken,
}

impl Cluster {
    /// Starts the control plane of one manager with its KV member up.
    pub fn start() -> Self {
        let kv = Arc::new(MemoryBackend::new());
        let swarm = Arc::new(Swarm::default());
        let servers = FileServers::new(swarm.clone()).with_timings(ServerTimings {
            poll: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        });
        let control = Arc::new(Control::new(KvStore::new(kv.clone()), servers));
        let (ready, rx) = watch::channel(Some(1));
        let cancel = CancellationToken::new();
        tokio::spawn(control.clone().run_watcher(rx.clone(), cancel.clone()));
        tokio::spawn(control.run_gc(rx, cancel.clone()));
        Self {
            kv,
            swarm,
            ready,
            cancel,
        }
    }

    pub async fn host(&self, id: &str, addr: &str) -> Host {
        let shares = Arc::new(ShareMounts::default());
        let driver = FileDriver::new(
            self.swarm.clone(),
            Arc::new(Node {
                id: id.to_string(),
                addr: addr.to_string(),
            }),
            shares.clone(),
            shares.clone(),
            Arc::new(RefCountsMap::new(MOUNT_ROOT)),
            "vsphere",
        )
        .with_timings(DriverTimings {
            mount_retry: Duration::from_secs(1),
            mount_timeout: Duration::from_secs(10),
            remove_retry: Duration::from_secs(1),
            remove_timeout: Duration::from_secs(30),
        });
        driver.attach_store(KvStore::new(self.kv.clone()));
        driver
            .refcounts()
            .reconcile(&NoContainers, shares.as_ref(), &driver)
            .await
            .expect("refcount init");
        Host { driver, shares }
    }

    pub fn stop(&self) {
        self.ready.send_replace(None);
        self.cancel.cancel();
    }
}
