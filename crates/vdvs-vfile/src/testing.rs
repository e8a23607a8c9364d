//! In-memory orchestrator, volume runtime and share mounts for unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use vdvs_core::device::{DeviceIo, DeviceWatch, ShareMount, VolumeDevSpec};
use vdvs_core::error::{Result, VdvsError};
use vdvs_core::mounts::{MountEntry, MountTable};
use vdvs_core::runtime::{
    Orchestrator, ServiceRuntime, ServiceSpec, ServiceStatus, SwarmInfo, SwarmPeer, VolumeRuntime,
};

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct FakeServices {
    services: Mutex<Vec<ServiceStatus>>,
    polls: Mutex<HashMap<String, u32>>,
    ready_after: AtomicU32,
    created: AtomicU32,
    fail_create: AtomicBool,
    removed: Mutex<Vec<String>>,
    on_create: Mutex<Option<Hook>>,
}

impl FakeServices {
    /// Tasks report `pending` for the first `polls` checks.
    pub fn set_ready_after(&self, polls: u32) {
        self.ready_after.store(polls, Ordering::SeqCst);
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn on_create(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_create.lock() = Some(Box::new(hook));
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
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
impl ServiceRuntime for FakeServices {
    async fn service_create(&self, spec: &ServiceSpec) -> Result<String> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(VdvsError::Internal("image not found".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let status = ServiceStatus {
            id: format!("svc{}", n),
            name: spec.name.clone(),
            published_port: 30000 + n as u16,
        };
        let id = status.id.clone();
        self.services.lock().push(status);
        if let Some(hook) = self.on_create.lock().as_ref() {
            hook();
        }
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

    async fn task_states(&self, service_id: &str) -> Result<Vec<String>> {
        let mut polls = self.polls.lock();
        let seen = polls.entry(service_id.to_string()).or_default();
        *seen += 1;
        let state = if *seen > self.ready_after.load(Ordering::SeqCst) {
            "running"
        } else {
            "pending"
        };
        Ok(vec![state.to_string()])
    }

    async fn service_remove(&self, service_id: &str) -> Result<()> {
        let mut services = self.services.lock();
        let Some(pos) = services.iter().position(|s| s.id == service_id) else {
            return Err(VdvsError::NotFound(format!("service {}", service_id)));
        };
        let status = services.remove(pos);
        self.removed.lock().push(status.name);
        Ok(())
    }
}

/// Backing volumes by name; a volume stays busy for `busy_removals`
/// removal attempts.
#[derive(Default)]
pub struct FakeVolumes {
    pub volumes: Mutex<HashMap<String, HashMap<String, String>>>,
    busy_removals: AtomicU32,
    fail_create: AtomicBool,
}

impl FakeVolumes {
    pub fn exists(&self, name: &str) -> bool {
        self.volumes.lock().contains_key(name)
    }

    pub fn set_busy_removals(&self, n: u32) {
        self.busy_removals.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl VolumeRuntime for FakeVolumes {
    async fn volume_create(
        &self,
        _driver: &str,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(VdvsError::Quota("No space left on datastore".into()));
        }
        self.volumes.lock().insert(name.to_string(), options.clone());
        Ok(())
    }

    async fn volume_remove(&self, name: &str) -> Result<()> {
        if self.busy_removals.load(Ordering::SeqCst) > 0 {
            self.busy_removals.fetch_sub(1, Ordering::SeqCst);
            return Err(VdvsError::Busy("volume is in use".into()));
        }
        self.volumes
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VdvsError::NotFound(format!("no such volume: {}", name)))
    }

    async fn volume_inspect(&self, name: &str) -> Result<()> {
        if self.exists(name) {
            Ok(())
        } else {
            Err(VdvsError::NotFound(format!("no such volume: {}", name)))
        }
    }
}

pub struct FakeSwarm {
    pub node_id: String,
    pub addr: String,
}

impl FakeSwarm {
    pub fn node(id: &str, addr: &str) -> Self {
        Self {
            node_id: id.into(),
            addr: addr.into(),
        }
    }
}

#[async_trait]
impl Orchestrator for FakeSwarm {
    async fn swarm_info(&self) -> Result<SwarmInfo> {
        Ok(SwarmInfo {
            node_id: self.node_id.clone(),
            node_addr: self.addr.clone(),
            is_manager: true,
            managers: vec![SwarmPeer {
                node_id: self.node_id.clone(),
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

/// Share mounts of one host, visible through its mount table.
#[derive(Default)]
pub struct ShareHost {
    mounts: Mutex<Vec<MountEntry>>,
    /// Share mounts that fail with the transport exit status first.
    unreachable: AtomicU32,
    pub shares: Mutex<Vec<ShareMount>>,
}

impl ShareHost {
    pub fn set_unreachable(&self, attempts: u32) {
        self.unreachable.store(attempts, Ordering::SeqCst);
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounts.lock().iter().map(|m| m.target.clone()).collect()
    }
}

struct NoWatch;

#[async_trait]
impl DeviceWatch for NoWatch {
    async fn wait(&mut self, _device: &Path, _timeout: std::time::Duration) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DeviceIo for ShareHost {
    fn supported_filesystems(&self) -> Vec<String> {
        vec!["ext4".into()]
    }

    async fn mkfs(&self, _fstype: &str, _label: &str, _device: &Path) -> Result<()> {
        Ok(())
    }

    fn mkdir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn mount(&self, _mp: &Path, _fstype: &str, _device: &Path, _ro: bool) -> Result<()> {
        Err(VdvsError::Internal("block mounts are not used here".into()))
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let mut mounts = self.mounts.lock();
        let Some(pos) = mounts.iter().position(|m| m.target == mountpoint) else {
            return Err(VdvsError::Internal(format!("{} not mounted", mountpoint.display())));
        };
        mounts.remove(pos);
        Ok(())
    }

    async fn mount_share(&self, mountpoint: &Path, share: &ShareMount) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) > 0 {
            self.unreachable.fetch_sub(1, Ordering::SeqCst);
            return Err(VdvsError::Transport("exit status 255".into()));
        }
        self.mounts.lock().push(MountEntry {
            device: share.source(),
            target: mountpoint.to_path_buf(),
            fstype: "cifs".into(),
            options: String::new(),
        });
        self.shares.lock().push(share.clone());
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

impl MountTable for ShareHost {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        Ok(self.mounts.lock().clone())
    }
}
