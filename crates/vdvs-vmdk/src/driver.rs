//! Single-writer block volume driver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use vdvs_core::device::{fit_label, DeviceIo, DeviceWatch, VolumeDevSpec};
use vdvs_core::error::{Result, VdvsError, PLUGIN_INIT_ERROR};
use vdvs_core::mounts::MountTable;
use vdvs_core::plugin::{VolumeDriver, VolumeInfo, VolumeRequest};
use vdvs_core::refcount::{RefCountsMap, VolumeLifecycle};
use vdvs_core::volume::{
    is_full_name, make_full_name, normalize_name, split_name, validate_name, Access,
    CreateOptions, DEFAULT_FSTYPE,
};

use crate::service::{VolumeService, ATTACHED_DEVICE};

pub const VERSION: &str = "vSphere Volume Driver v0.5";

/// Block volume driver. One VM at a time may use a volume.
pub struct BlockDriver {
    service: Arc<dyn VolumeService>,
    device: Arc<dyn DeviceIo>,
    mounts: Arc<dyn MountTable>,
    refcounts: Arc<RefCountsMap>,
    /// Mount request id to the full name it was mounted under.
    mount_ids: DashMap<String, String>,
}

impl BlockDriver {
    pub fn new(
        service: Arc<dyn VolumeService>,
        device: Arc<dyn DeviceIo>,
        mounts: Arc<dyn MountTable>,
        refcounts: Arc<RefCountsMap>,
    ) -> Self {
        info!(version = VERSION, root = %refcounts.mount_root().display(), "block volume driver started");
        Self {
            service,
            device,
            mounts,
            refcounts,
            mount_ids: DashMap::new(),
        }
    }

    pub fn refcounts(&self) -> &Arc<RefCountsMap> {
        &self.refcounts
    }

    fn mount_root(&self) -> &Path {
        self.refcounts.mount_root()
    }

    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.mount_root().join(name)
    }

    fn mountpoint_string(&self, name: &str) -> String {
        self.mountpoint(name).to_string_lossy().into_owned()
    }

    /// Full name of a volume plus its status when it had to be fetched.
    async fn resolve(&self, name: &str) -> Result<(String, Option<HashMap<String, Value>>)> {
        let name = normalize_name(name);
        if is_full_name(&name) {
            return Ok((name, None));
        }
        let status = self.get_volume(&name).await?;
        match status.get("datastore").and_then(Value::as_str) {
            Some(ds) if !ds.is_empty() => Ok((make_full_name(&name, ds), Some(status))),
            _ => Err(VdvsError::Internal(format!(
                "Unable to determine the datastore of volume {}",
                name
            ))),
        }
    }

    fn prepare_watch(&self, name: &str) -> Option<Box<dyn DeviceWatch>> {
        match self.device.prepare_watch() {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(name, error = %e, "Failed to initialize wait context, continuing however..");
                None
            }
        }
    }

    async fn detach_quietly(&self, name: &str) {
        if let Err(e) = self.service.detach(name).await {
            warn!(name, error = %e, "Detach volume failed");
        }
    }

    async fn detach_and_remove(&self, name: &str) {
        self.detach_quietly(name).await;
        if let Err(e) = self.service.remove(name, &HashMap::new()).await {
            warn!(name, error = %e, "Remove volume failed");
        }
    }

    /// Attach, wait for the device node and build a filesystem on it.
    async fn format(&self, name: &str, fstype: &str) -> Result<()> {
        let watch = self.prepare_watch(name);
        let spec = match self.service.attach(name).await {
            Ok(spec) => spec,
            Err(e) => {
                error!(name, error = %e, "Attach volume failed, removing the volume");
                if let Err(re) = self.service.remove(name, &HashMap::new()).await {
                    warn!(name, error = %re, "Remove volume failed");
                }
                return Err(e);
            }
        };

        let label = fit_label(fstype, split_name(name).0);
        let prepared = async {
            let dev = self.device.device_path(&spec)?;
            self.device.attach_wait(watch, &dev).await?;
            self.device.mkfs(fstype, label, &dev).await
        };
        if let Err(e) = prepared.await {
            error!(name, error = %e, "Create filesystem failed, removing the volume");
            self.detach_and_remove(name).await;
            return Err(e);
        }

        self.service.detach(name).await.map_err(|e| {
            error!(name, error = %e, "Detach volume failed");
            e
        })
    }

    /// Device of a volume the service reports as attached to this VM.
    async fn local_attachment(&self, name: &str) -> Option<VolumeDevSpec> {
        let vm = self.service.vm_name()?;
        match self.service.get(name).await {
            Ok(status) => attached_device(&status, vm),
            Err(e) => {
                debug!(name, error = %e, "No volume metadata, attaching");
                None
            }
        }
    }

    async fn process_mount(&self, req: &VolumeRequest) -> Result<String> {
        let (name, status) = self.resolve(&req.name).await.map_err(|e| {
            error!(name = %req.name, error = %e, "Unable to get volume info");
            e
        })?;
        if !req.id.is_empty() {
            self.mount_ids.insert(req.id.clone(), name.clone());
        }

        let refcnt = self.refcounts.incr(&name);
        debug!(name, refcnt, "volume refcount");
        if refcnt > 1 {
            info!(name, refcount = refcnt, "Already mounted, skipping mount.");
            return Ok(self.mountpoint_string(&name));
        }
        if self.mounts.is_mounted(&name, self.mount_root()) {
            info!(name, "Already mounted, skipping mount.");
            return Ok(self.mountpoint_string(&name));
        }

        let status = match status {
            Some(s) => s,
            None => match self.get_volume(&name).await {
                Ok(s) => s,
                Err(e) => {
                    if let Err(de) = self.refcounts.decr(&name) {
                        warn!(name, error = %de, "Refcount rollback failed");
                    }
                    return Err(e);
                }
            },
        };
        let read_only = match status.get("access").and_then(Value::as_str) {
            Some(a) => a == Access::ReadOnly.as_str(),
            None => {
                warn!(name, "Invalid access type, assuming read-write access.");
                false
            }
        };
        let fstype = match status.get("fstype").and_then(Value::as_str) {
            Some(f) => f.to_string(),
            None => {
                warn!(name, fstype = DEFAULT_FSTYPE, "Invalid filesystem type, assuming default");
                DEFAULT_FSTYPE.to_string()
            }
        };

        match self.mount_volume(&name, &fstype, read_only).await {
            Ok(mp) => Ok(mp.to_string_lossy().into_owned()),
            Err(e) => {
                error!(name, error = %e, "Failed to mount");
                if let Ok(0) = self.refcounts.decr(&name) {
                    info!(name, "Detaching - it is not used anymore");
                    self.detach_quietly(&name).await;
                }
                Err(e)
            }
        }
    }
}

fn attached_device(status: &HashMap<String, Value>, vm: &str) -> Option<VolumeDevSpec> {
    if status.get("status").and_then(Value::as_str) != Some("attached")
        || status.get("attached to VM").and_then(Value::as_str) != Some(vm)
    {
        return None;
    }
    serde_json::from_value(status.get(ATTACHED_DEVICE)?.clone()).ok()
}

#[async_trait]
impl VolumeLifecycle for BlockDriver {
    async fn get_volume(&self, name: &str) -> Result<HashMap<String, Value>> {
        if name.is_empty() {
            return Err(VdvsError::InvalidArgument(
                "No volume with name as empty string exists".to_string(),
            ));
        }
        self.service.get(name).await.map_err(|e| {
            error!(name, error = %e, "Failed to get volume meta-data");
            e
        })
    }

    async fn mount_volume(&self, name: &str, fstype: &str, read_only: bool) -> Result<PathBuf> {
        let mountpoint = self.mountpoint(name);
        self.device.mkdir(&mountpoint).map_err(|e| {
            error!(name, dir = %mountpoint.display(), error = %e, "Failed to make directory for volume mount");
            e
        })?;

        let dev = match self.local_attachment(name).await {
            Some(spec) => {
                info!(name, "Volume is already attached to this VM, skipping attach");
                self.device.device_path(&spec)?
            }
            None => {
                let watch = self.prepare_watch(name);
                let spec = self.service.attach(name).await.map_err(|e| {
                    error!(name, error = %e, "Attach volume failed");
                    e
                })?;
                let dev = self.device.device_path(&spec)?;
                self.device.attach_wait(watch, &dev).await?;
                dev
            }
        };
        self.device.mount(&mountpoint, fstype, &dev, read_only).await?;
        info!(name, device = %dev.display(), mountpoint = %mountpoint.display(), "volume mounted");
        Ok(mountpoint)
    }

    async fn unmount_volume(&self, name: &str) -> Result<()> {
        let mountpoint = self.mountpoint(name);
        if let Err(e) = self.device.unmount(&mountpoint).await {
            error!(mountpoint = %mountpoint.display(), error = %e, "Failed to unmount volume. Now trying to detach...");
        }
        self.service.detach(name).await
    }
}

#[async_trait]
impl VolumeDriver for BlockDriver {
    fn name(&self) -> &str {
        "vsphere"
    }

    async fn create(&self, req: VolumeRequest) -> Result<()> {
        validate_name(&req.name)?;
        let mut opts = CreateOptions::parse(&req.options())?;
        opts.apply_default_fstype();
        if let Some(fstype) = opts.fstype.as_deref() {
            self.device.verify_fs_support(fstype).map_err(|e| {
                error!(name = %req.name, fstype, error = %e, "Not supported");
                e
            })?;
        }

        if opts.is_clone() {
            return self.service.create(&req.name, &opts.to_map()).await.map_err(|e| {
                error!(name = %req.name, error = %e, "Clone volume failed");
                e
            });
        }

        self.service.create(&req.name, &opts.to_map()).await.map_err(|e| {
            error!(name = %req.name, error = %e, "Create volume failed");
            e
        })?;
        let fstype = opts.fstype.as_deref().unwrap_or(DEFAULT_FSTYPE);
        info!(name = %req.name, fstype, "Attaching volume and creating filesystem");
        self.format(&req.name, fstype).await?;
        info!(name = %req.name, fstype, "Volume and filesystem created");
        Ok(())
    }

    async fn remove(&self, req: VolumeRequest) -> Result<()> {
        info!(name = %req.name, "Removing volume");
        if !self.refcounts.is_initialized() {
            let msg = format!("{} Cannot remove volume={}", PLUGIN_INIT_ERROR, req.name);
            error!("{}", msg);
            return Err(VdvsError::NotInitialized(msg));
        }
        let name = match self.resolve(&req.name).await {
            Ok((full, _)) => full,
            Err(_) => req.name.clone(),
        };
        let refcount = self.refcounts.get(&name);
        if refcount != 0 {
            let msg = format!(
                "Remove failure - volume is still mounted. volume={}, refcount={}",
                name, refcount
            );
            error!("{}", msg);
            return Err(VdvsError::Busy(msg));
        }
        self.service.remove(&req.name, &req.options()).await.map_err(|e| {
            error!(name = %req.name, error = %e, "Failed to remove volume");
            e
        })
    }

    async fn mount(&self, req: VolumeRequest) -> Result<String> {
        info!(name = %req.name, "Mounting volume");
        let _state = self.refcounts.lock_state().await;
        self.refcounts.mark_dirty();
        self.process_mount(&req).await
    }

    async fn unmount(&self, req: VolumeRequest) -> Result<()> {
        info!(name = %req.name, "Unmounting Volume");
        let _state = self.refcounts.lock_state().await;
        if !self.refcounts.is_initialized() {
            self.refcounts.mark_dirty();
            return Ok(());
        }

        let name = match self.mount_ids.remove(&req.id) {
            Some((_, full)) => full,
            None => {
                self.resolve(&req.name)
                    .await
                    .map_err(|e| {
                        error!(name = %req.name, error = %e, "Unable to get volume info");
                        e
                    })?
                    .0
            }
        };

        let refcnt = match self.refcounts.decr(&name) {
            Ok(c) => c,
            Err(e) => {
                error!(name, error = %e, "Refcount error - still trying to unmount...");
                0
            }
        };
        if refcnt >= 1 {
            info!(name, refcount = refcnt, "Still in use, skipping unmount request.");
            return Ok(());
        }
        self.unmount_volume(&name).await.map_err(|e| {
            error!(name, error = %e, "Failed to unmount");
            e
        })
    }

    async fn get(&self, req: VolumeRequest) -> Result<VolumeInfo> {
        let status = self.get_volume(&req.name).await?;
        Ok(VolumeInfo {
            mountpoint: self.mountpoint_string(&req.name),
            name: req.name,
            status,
        })
    }

    async fn list(&self) -> Result<Vec<VolumeInfo>> {
        let volumes = self.service.list().await.map_err(|e| {
            error!(error = %e, "Failed to get volume list");
            e
        })?;
        Ok(volumes
            .into_iter()
            .map(|v| VolumeInfo {
                mountpoint: self.mountpoint_string(&v.name),
                name: normalize_name(&v.name),
                status: HashMap::new(),
            })
            .collect())
    }

    async fn path(&self, req: VolumeRequest) -> Result<String> {
        Ok(self.mountpoint_string(&req.name))
    }
}
