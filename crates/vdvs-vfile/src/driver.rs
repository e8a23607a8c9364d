//! Shared file volume driver.
//!
//! A file volume is a backing volume of the internal driver exported by a
//! file-share server. Every host mounts it over CIFS from the loopback
//! address; the global refcount in the cluster store decides when the
//! server runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use vdvs_core::device::{DeviceIo, ShareMount};
use vdvs_core::error::{ErrorKind, Result, VdvsError, PLUGIN_INIT_ERROR};
use vdvs_core::mounts::MountTable;
use vdvs_core::plugin::{VolumeDriver, VolumeInfo, VolumeRequest};
use vdvs_core::refcount::{RefCountsMap, VolumeLifecycle};
use vdvs_core::runtime::{Orchestrator, VolumeRuntime};
use vdvs_core::volume::validate_name;
use vdvs_kv::{annotate, Cmp, KvLock, KvStore, Op, PREFIX_STATE};

use crate::metadata::{
    client_key, client_prefix, gref_key, info_key, internal_volume, parse_gref, state_key,
    VolState, VolumeRecord,
};

pub const VERSION: &str = "vFile Volume Driver v0.2";

pub const INIT_ERROR: &str = "vFile volume driver is not fully initialized yet.";

#[derive(Debug, Clone, Copy)]
pub struct DriverTimings {
    /// Pause between CIFS mount attempts while the server is unreachable.
    pub mount_retry: Duration,
    pub mount_timeout: Duration,
    /// Pause between removal attempts of a backing volume still in use.
    pub remove_retry: Duration,
    pub remove_timeout: Duration,
}

impl Default for DriverTimings {
    fn default() -> Self {
        Self {
            mount_retry: Duration::from_secs(1),
            mount_timeout: vdvs_kv::store::SERVICE_START_TIMEOUT,
            remove_retry: Duration::from_secs(1),
            remove_timeout: vdvs_kv::store::SERVICE_START_TIMEOUT,
        }
    }
}

pub struct FileDriver {
    store: OnceLock<KvStore>,
    volumes: Arc<dyn VolumeRuntime>,
    orchestrator: Arc<dyn Orchestrator>,
    device: Arc<dyn DeviceIo>,
    mounts: Arc<dyn MountTable>,
    refcounts: Arc<RefCountsMap>,
    internal_driver: String,
    mount_ids: DashMap<String, String>,
    timings: DriverTimings,
}

impl FileDriver {
    pub fn new(
        volumes: Arc<dyn VolumeRuntime>,
        orchestrator: Arc<dyn Orchestrator>,
        device: Arc<dyn DeviceIo>,
        mounts: Arc<dyn MountTable>,
        refcounts: Arc<RefCountsMap>,
        internal_driver: &str,
    ) -> Self {
        info!(version = VERSION, internal_driver, "vFile plugin started");
        Self {
            store: OnceLock::new(),
            volumes,
            orchestrator,
            device,
            mounts,
            refcounts,
            internal_driver: internal_driver.to_string(),
            mount_ids: DashMap::new(),
            timings: DriverTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: DriverTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Completes initialization. Later calls are ignored.
    pub fn attach_store(&self, store: KvStore) {
        if self.store.set(store).is_err() {
            warn!("KV store already attached");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.store.get().is_some()
    }

    pub fn refcounts(&self) -> &Arc<RefCountsMap> {
        &self.refcounts
    }

    fn store(&self) -> Result<&KvStore> {
        self.store
            .get()
            .ok_or_else(|| VdvsError::NotInitialized(INIT_ERROR.to_string()))
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

    async fn client_list(&self, store: &KvStore, name: &str) -> Vec<String> {
        match store.kv_map(&client_prefix(name)).await {
            Ok(clients) => {
                let mut addrs: Vec<String> = clients.into_values().collect();
                addrs.sort();
                addrs
            }
            Err(e) => {
                warn!(name, error = %e, "Failed to get client list");
                vec![]
            }
        }
    }

    async fn status(&self, store: &KvStore, name: &str) -> Result<HashMap<String, Value>> {
        let keys = [state_key(name), gref_key(name), info_key(name)];
        let entries = store.read_batch(&keys).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                info!(name, "Volume not found");
            } else {
                warn!(name, error = %e, "Failed to read metadata for volume from KV store");
            }
            e
        })?;
        let record = VolumeRecord::parse(&entries[2].1)?;
        let mut status = HashMap::new();
        status.insert("Volume Status".to_string(), json!(entries[0].1));
        status.insert("Global Refcount".to_string(), json!(parse_gref(&entries[1].1)));
        status.insert("File server Port".to_string(), json!(record.port));
        status.insert("Service name".to_string(), json!(record.service_name));
        status.insert(
            "Clients".to_string(),
            json!(self.client_list(store, name).await),
        );
        Ok(status)
    }

    async fn lock_gref(&self, store: &KvStore, name: &str) -> Result<KvLock> {
        let mut lock = store.create_lock(&gref_key(name));
        if let Err(e) = lock.blocking_lock_with_lease().await {
            error!(name, error = %e, "Failed to blocking wait lock for global refcount");
            lock.clear();
            return Err(e);
        }
        Ok(lock)
    }

    async fn read_gref(&self, store: &KvStore, name: &str) -> Result<u64> {
        let entries = store.read_batch(&[gref_key(name)]).await?;
        Ok(entries.first().map(|(_, v)| parse_gref(v)).unwrap_or_default())
    }

    /// Drops this node's reference: gref goes down (never below 0) and the
    /// client key goes away in one transaction.
    async fn drop_reference(&self, store: &KvStore, name: &str, node_id: &str) -> Result<()> {
        let gref = self.read_gref(store, name).await?;
        if gref == 0 {
            warn!(name, "Global refcount is 0 before unmounting, possible errors in previous operations to this volume");
        }
        store
            .update_batch(vec![
                Op::put(gref_key(name), gref.saturating_sub(1).to_string()),
                Op::delete(client_key(name, node_id)),
            ])
            .await?;
        Ok(())
    }

    /// CIFS mount, retried while the server does not answer yet.
    async fn mount_share(&self, name: &str, mountpoint: &Path, record: &VolumeRecord) -> Result<()> {
        let share = ShareMount::loopback(record.port, &record.username, &record.password);
        info!(name, ?share, "Mounting volume with options");
        let mut tick = tokio::time::interval(self.timings.mount_retry);
        let deadline = tokio::time::sleep(self.timings.mount_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.device.mount_share(mountpoint, &share).await {
                        Ok(()) => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::Transport => {
                            warn!(name, error = %e, "Mount failed, file server not reachable yet");
                        }
                        Err(e) => {
                            error!(name, error = %e, "Mount failed");
                            return Err(e);
                        }
                    }
                }
                _ = &mut deadline => {
                    let msg = format!("Failed to mount vFile volume {} after timeout", name);
                    error!("{}", msg);
                    return Err(VdvsError::Timeout(msg));
                }
            }
        }
    }

    /// Removes the backing volume, retrying while it is still in use by a
    /// stopping server. Leftovers are logged.
    async fn delete_backing(&self, name: &str) {
        let backing = internal_volume(name);
        let mut tick = tokio::time::interval(self.timings.remove_retry);
        let deadline = tokio::time::sleep(self.timings.remove_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let Err(e) = self.volumes.volume_remove(&backing).await else {
                        info!(name, backing, "internal volume removed");
                        return;
                    };
                    if let Err(inspect) = self.volumes.volume_inspect(&backing).await {
                        warn!(name, error = %e, inspect_error = %inspect, "Failed to remove internal volume");
                        return;
                    }
                    warn!(name, error = %e, "Internal volume still in use. Wait and retry before timeout.");
                }
                _ = &mut deadline => {
                    warn!(name, backing, "Timeout to remove internal volume");
                    return;
                }
            }
        }
    }

    async fn process_mount(&self, req: &VolumeRequest) -> Result<String> {
        let name = req.name.clone();
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
        match self.mount_volume(&name, "", false).await {
            Ok(mountpoint) => Ok(mountpoint.to_string_lossy().into_owned()),
            Err(e) => {
                error!(name, error = %e, "Failed to mount");
                if let Err(de) = self.refcounts.decr(&name) {
                    warn!(name, error = %de, "Refcount rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl VolumeLifecycle for FileDriver {
    async fn get_volume(&self, name: &str) -> Result<HashMap<String, Value>> {
        let store = self.store()?;
        self.status(store, name).await
    }

    /// Takes a global reference, waits for the server and mounts its share.
    async fn mount_volume(&self, name: &str, _fstype: &str, _read_only: bool) -> Result<PathBuf> {
        let store = self.store()?;
        let mountpoint = self.mountpoint(name);
        self.device.mkdir(&mountpoint).map_err(|e| {
            error!(name, dir = %mountpoint.display(), "Failed to make directory for volume mount");
            e
        })?;
        let node = self.orchestrator.swarm_info().await?;

        let mut lock = self.lock_gref(store, name).await?;
        let result = async {
            let gref = self.read_gref(store, name).await?;
            // A 0 -> 1 here is what wakes the managers' watchers.
            store
                .update_batch(vec![
                    Op::put(gref_key(name), (gref + 1).to_string()),
                    Op::put(client_key(name, &node.node_id), node.node_addr.clone()),
                ])
                .await?;

            let mounted = async {
                let info = store
                    .blocking_wait_and_get(&state_key(name), VolState::Mounted.as_str(), &info_key(name))
                    .await
                    .map_err(|e| {
                        error!(name, error = %e, "Failed to blocking wait for Mounted state");
                        e
                    })?;
                info!(name, "Volume state mounted, prepare to mounting locally");
                let record = VolumeRecord::parse(&info)?;
                self.mount_share(name, &mountpoint, &record).await?;
                Ok::<(), VdvsError>(())
            }
            .await;
            if let Err(e) = mounted {
                if let Err(undo) = self.drop_reference(store, name, &node.node_id).await {
                    warn!(name, error = %undo, "Failed to roll back global refcount");
                }
                return Err(e);
            }
            Ok::<(), VdvsError>(())
        }
        .await;
        lock.release().await;
        result.map(|_| mountpoint)
    }

    /// Unmounts locally and drops this node's global reference. A drop to 0
    /// lets the watchers stop the server.
    async fn unmount_volume(&self, name: &str) -> Result<()> {
        let store = self.store()?;
        let mountpoint = self.mountpoint(name);
        self.device.unmount(&mountpoint).await.map_err(|e| {
            error!(mountpoint = %mountpoint.display(), error = %e, "Failed to unmount volume");
            e
        })?;
        let node = self.orchestrator.swarm_info().await.map_err(|e| {
            error!(name, error = %e, "Failed to get swarm info for unmount");
            e
        })?;
        let mut lock = self.lock_gref(store, name).await?;
        let result = self.drop_reference(store, name, &node.node_id).await;
        lock.release().await;
        result.map_err(|e| {
            warn!(name, node_id = %node.node_id, error = %e, "Failed to update GRef and delete ClientList");
            e
        })
    }
}

#[async_trait]
impl VolumeDriver for FileDriver {
    fn name(&self) -> &str {
        "vfile"
    }

    async fn create(&self, req: VolumeRequest) -> Result<()> {
        info!(name = %req.name, "VolumeDriver Create");
        let store = self.store()?;
        validate_name(&req.name)?;
        let name = req.name.as_str();

        let record = VolumeRecord::with_new_credentials();
        let created = store
            .backend()
            .txn(
                vec![Cmp::missing(state_key(name))],
                vec![
                    Op::put(state_key(name), VolState::Creating.as_str()),
                    Op::put(gref_key(name), "0"),
                    Op::put(info_key(name), record.to_json()?),
                ],
                vec![],
            )
            .await
            .map_err(|e| annotate(&format!("Failed to create volume {}", name), e))?;
        if !created.succeeded {
            return Err(VdvsError::AlreadyExists(format!(
                "Volume {} already exists",
                name
            )));
        }

        info!(name, "Attempting to create internal volume");
        let backing = internal_volume(name);
        if let Err(e) = self
            .volumes
            .volume_create(&self.internal_driver, &backing, &req.options())
            .await
        {
            let msg = format!(
                "Failed to create internal volume {}. Reason: {}. Check the status of the volumes belonging to driver \"{}\".",
                name, e, self.internal_driver
            );
            warn!("{}", msg);
            if let Err(e) = store.delete_keys_for(name).await {
                warn!(name, error = %e, "Failed to remove metadata entry for volume");
            }
            return Err(VdvsError::Internal(msg));
        }

        if !store
            .compare_and_put(&state_key(name), VolState::Creating.as_str(), VolState::Ready.as_str())
            .await
        {
            let mut msg = format!("Failed to set status of volume {} to ready.", name);
            warn!("{}", msg);
            if let Err(e) = self.volumes.volume_remove(&backing).await {
                msg.push_str(&format!(
                    " Failed to remove internal volume. Reason {}. Please remove the volume manually. Volume: {}",
                    e, backing
                ));
            }
            if let Err(e) = store.delete_keys_for(name).await {
                warn!(name, error = %e, "Failed to remove metadata entry for volume");
            }
            return Err(VdvsError::Internal(msg));
        }
        info!(name, "Successfully created volume");
        Ok(())
    }

    async fn remove(&self, req: VolumeRequest) -> Result<()> {
        info!(name = %req.name, "Removing volume");
        let store = self.store()?;
        let name = req.name.as_str();
        if !self.refcounts.is_initialized() {
            let msg = format!("{} Cannot remove volume {}", PLUGIN_INIT_ERROR, name);
            error!("{}", msg);
            return Err(VdvsError::NotInitialized(msg));
        }
        if self.refcounts.get(name) != 0 {
            let msg = format!(
                "Remove failed: Containers on this host VM are still using volume {}.",
                name
            );
            error!("{}", msg);
            return Err(VdvsError::Busy(msg));
        }

        let mut gref_lock = self.lock_gref(store, name).await?;
        let mut state_lock = store.create_lock(&state_key(name));
        if let Err(e) = state_lock.try_lock().await {
            error!(name, error = %e, "Failed to try lock for removing volume");
            state_lock.clear();
            gref_lock.release().await;
            return Err(e);
        }

        let marked = store
            .write_batch(&[
                (gref_key(name), "0".to_string()),
                (state_key(name), VolState::Deleting.as_str().to_string()),
            ])
            .await;
        state_lock.release().await;
        if let Err(e) = marked {
            gref_lock.release().await;
            return Err(annotate(
                &format!("Failed to reset global refcount and state before removing volume {}", name),
                e,
            ));
        }

        info!(name, "Attempting to delete internal volume");
        self.delete_backing(name).await;

        info!(name, "Attempting to delete volume metadata");
        let deleted = store.delete_keys_for(name).await;
        gref_lock.release().await;
        deleted
    }

    async fn mount(&self, req: VolumeRequest) -> Result<String> {
        info!(name = %req.name, "Mounting volume");
        self.store()?;
        let _state = self.refcounts.lock_state().await;
        self.refcounts.mark_dirty();
        self.process_mount(&req).await
    }

    async fn unmount(&self, req: VolumeRequest) -> Result<()> {
        info!(name = %req.name, "Unmounting Volume");
        self.store()?;
        let _state = self.refcounts.lock_state().await;
        if !self.refcounts.is_initialized() {
            self.refcounts.mark_dirty();
            return Ok(());
        }
        let name = self
            .mount_ids
            .remove(&req.id)
            .map(|(_, name)| name)
            .unwrap_or_else(|| req.name.clone());

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
        self.unmount_volume(&name).await
    }

    async fn get(&self, req: VolumeRequest) -> Result<VolumeInfo> {
        info!(name = %req.name, "VolumeDriver Get");
        let store = self.store()?;
        let status = self.status(store, &req.name).await?;
        Ok(VolumeInfo {
            mountpoint: self.mountpoint_string(&req.name),
            name: req.name,
            status,
        })
    }

    async fn list(&self) -> Result<Vec<VolumeInfo>> {
        let store = self.store()?;
        let names = store.list(PREFIX_STATE).await.map_err(|e| {
            error!(error = %e, "Failed to get volume list");
            e
        })?;
        Ok(names
            .into_iter()
            .map(|name| VolumeInfo {
                mountpoint: self.mountpoint_string(&name),
                name,
                status: HashMap::new(),
            })
            .collect())
    }

    async fn path(&self, req: VolumeRequest) -> Result<String> {
        Ok(self.mountpoint_string(&req.name))
    }
}
