//! Shared fixtures: a device layer that records mounts into a table the
//! driver can read back, and a scripted container runtime.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vdvs_core::device::{DeviceIo, DeviceWatch, ShareMount, VolumeDevSpec};
use vdvs_core::error::Result;
use vdvs_core::mounts::{MountEntry, MountTable};
use vdvs_core::runtime::{ContainerMount, ContainerRuntime, ContainerSummary};
use vdvs_core::{RefCountsMap, VdvsError};
use vdvs_vmdk::{BlockDriver, MockService};

pub const MOUNT_ROOT: &str = "/mnt/vmdk";

/// Kernel mount table shared between the fake device layer and the driver.
#[derive(Default, Clone)]
pub struct SharedTable {
    mounts: Arc<Mutex<Vec<MountEntry>>>,
}

impl SharedTable {
    pub fn add(&self, device: &str, mountpoint: &Path, fstype: &str) {
        self.mounts.lock().push(MountEntry {
            device: device.to_string(),
            target: mountpoint.to_path_buf(),
            fstype: fstype.to_string(),
            options: "rw".to_string(),
        });
    }

    pub fn remove(&self, mountpoint: &Path) -> bool {
        let mut mounts = self.mounts.lock();
        let before = mounts.len();
        mounts.retain(|m| m.target != mountpoint);
        before != mounts.len()
    }

    pub fn len(&self) -> usize {
        self.mounts.lock().len()
    }
}

impl MountTable for SharedTable {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        Ok(self.mounts.lock().clone())
    }
}

struct Ready;

#[async_trait]
impl DeviceWatch for Ready {
    async fn wait(&mut self, _device: &Path, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Device layer that mounts into [`SharedTable`].
pub struct TableDevice {
    pub table: SharedTable,
    pub formatted: Mutex<Vec<String>>,
}

#[async_trait]
impl DeviceIo for TableDevice {
    fn supported_filesystems(&self) -> Vec<String> {
        vec!["ext4".to_string(), "xfs".to_string()]
    }

    async fn mkfs(&self, fstype: &str, label: &str, _device: &Path) -> Result<()> {
        self.formatted.lock().push(format!("{}:{}", fstype, label));
        Ok(())
    }

    fn mkdir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn mount(&self, mountpoint: &Path, fstype: &str, device: &Path, _ro: bool) -> Result<()> {
        self.table.add(&device.to_string_lossy(), mountpoint, fstype);
        Ok(())
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        if self.table.remove(mountpoint) {
            Ok(())
        } else {
            Err(VdvsError::Internal(format!("{} not mounted", mountpoint.display())))
        }
    }

    async fn mount_share(&self, _mountpoint: &Path, _share: &ShareMount) -> Result<()> {
        Ok(())
    }

    fn device_path(&self, spec: &VolumeDevSpec) -> Result<PathBuf> {
        Ok(PathBuf::from(format!("/dev/sd{}", spec.unit)))
    }

    fn prepare_watch(&self) -> Result<Box<dyn DeviceWatch>> {
        Ok(Box::new(Ready))
    }

    async fn delete_device_path(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Container runtime whose containers are set by the test.
#[derive(Default, Clone)]
pub struct ScriptedRuntime {
    containers: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl ScriptedRuntime {
    /// Adds a running container that uses the given volumes.
    pub fn run(&self, id: &str, volumes: &[&str]) {
        self.containers.lock().insert(
            id.to_string(),
            volumes.iter().map(|v| v.to_string()).collect(),
        );
    }

    pub fn stop(&self, id: &str) {
        self.containers.lock().remove(id);
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn active_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .keys()
            .map(|id| ContainerSummary {
                id: id.clone(),
                names: vec![format!("/{}", id)],
                state: "running".to_string(),
            })
            .collect())
    }

    async fn container_mounts(&self, id: &str) -> Result<Vec<ContainerMount>> {
        let containers = self.containers.lock();
        let volumes = containers
            .get(id)
            .ok_or_else(|| VdvsError::NotFound(format!("No such container: {}", id)))?;
        Ok(volumes
            .iter()
            .map(|v| ContainerMount {
                name: v.clone(),
                source: format!("{}/{}", MOUNT_ROOT, v),
                destination: "/data".to_string(),
                driver: "vsphere".to_string(),
            })
            .collect())
    }
}

/// One plugin process: driver plus the pieces a restart keeps.
pub struct Host {
    pub driver: Arc<BlockDriver>,
    pub refcounts: Arc<RefCountsMap>,
}

/// Pieces that outlive a plugin restart: the hypervisor, the kernel mount
/// table and the container engine.
#[derive(Clone)]
pub struct World {
    pub service: Arc<MockService>,
    pub table: SharedTable,
    pub device: Arc<TableDevice>,
    pub runtime: ScriptedRuntime,
}

impl World {
    pub fn new() -> Self {
        let table = SharedTable::default();
        Self {
            service: Arc::new(MockService::new()),
            device: Arc::new(TableDevice {
                table: table.clone(),
                formatted: Mutex::new(Vec::new()),
            }),
            table,
            runtime: ScriptedRuntime::default(),
        }
    }

    /// Starts a plugin process and runs one reconciliation pass.
    pub async fn start(&self) -> Host {
        let refcounts = Arc::new(RefCountsMap::new(MOUNT_ROOT));
        let driver = Arc::new(BlockDriver::new(
            self.service.clone(),
            self.device.clone(),
            Arc::new(self.table.clone()),
            refcounts.clone(),
        ));
        refcounts
            .reconcile(&self.runtime, &self.table, driver.as_ref())
            .await
            .expect("reconcile");
        Host { driver, refcounts }
    }
}
