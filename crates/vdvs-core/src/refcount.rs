//! Per-host volume reference counts and their crash-recovery reconciliation.
//!
//! The runtime calls `Mount` once per container using a volume and `Unmount`
//! once per container stopping. The plugin keeps the resulting counts in
//! memory, so after a restart they are rebuilt from the containers that are
//! still active and from the kernel mount table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, VdvsError};
use crate::mounts::MountTable;
use crate::runtime::ContainerRuntime;
use crate::volume::{is_full_name, make_full_name, Access, DEFAULT_FSTYPE};

/// Mount sources of managed (v2) plugins live below this directory.
pub const MANAGED_PLUGIN_ROOT: &str = "/var/lib/docker/plugins/";

/// Back-off between reconciliation attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub first_delay: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(2),
            attempts: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefEntry {
    pub count: u32,
    pub mounted: bool,
    pub device: String,
}

/// Driver operations reconciliation needs to repair mounts.
#[async_trait]
pub trait VolumeLifecycle: Send + Sync {
    /// Authoritative status of a volume, as reported by `Get`.
    async fn get_volume(&self, name: &str) -> Result<HashMap<String, Value>>;

    /// Attaches (if needed) and mounts a volume, returning the mountpoint.
    async fn mount_volume(&self, name: &str, fstype: &str, read_only: bool) -> Result<PathBuf>;

    /// Unmounts and detaches a volume.
    async fn unmount_volume(&self, name: &str) -> Result<()>;
}

/// Process-wide reference counts keyed by full volume name.
#[derive(Debug)]
pub struct RefCountsMap {
    entries: Mutex<HashMap<String, RefEntry>>,
    state: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
    initialized: AtomicBool,
    mount_root: PathBuf,
}

impl RefCountsMap {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            state: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            mount_root: mount_root.into(),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Serializes mount/unmount handling with reconciliation.
    pub async fn lock_state(&self) -> MutexGuard<'_, ()> {
        self.state.lock().await
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Tells an in-flight reconciliation that counts changed under it.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Current count; 1 while reconciliation has not finished so callers
    /// treat every volume as possibly in use.
    pub fn get(&self, name: &str) -> u32 {
        if !self.is_initialized() {
            return 1;
        }
        self.entries.lock().get(name).map(|e| e.count).unwrap_or(0)
    }

    pub fn incr(&self, name: &str) -> u32 {
        let mut entries = self.entries.lock();
        let entry = entries.entry(name.to_string()).or_default();
        entry.count += 1;
        entry.count
    }

    pub fn decr(&self, name: &str) -> Result<u32> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            return Err(VdvsError::Internal(format!(
                "Decr: Missing refcount. name={}",
                name
            )));
        };
        if entry.count == 0 {
            warn!(name, "Decr: refcnt already 0");
            entries.remove(name);
            return Ok(0);
        }
        entry.count -= 1;
        let count = entry.count;
        if count == 0 {
            entries.remove(name);
        }
        Ok(count)
    }

    pub fn snapshot(&self) -> HashMap<String, RefEntry> {
        self.entries.lock().clone()
    }

    async fn is_dirty(&self) -> bool {
        let _state = self.state.lock().await;
        self.dirty.load(Ordering::Acquire)
    }

    /// True for mount sources that belong to this driver.
    pub fn is_managed_source(&self, source: &str) -> bool {
        let Some(root) = self.mount_root.to_str() else {
            return false;
        };
        source.starts_with(root)
            || (source.starts_with(MANAGED_PLUGIN_ROOT) && source.contains(root))
    }

    /// One reconciliation pass.
    pub async fn reconcile(
        &self,
        runtime: &dyn ContainerRuntime,
        table: &dyn MountTable,
        lifecycle: &dyn VolumeLifecycle,
    ) -> Result<()> {
        {
            let _state = self.state.lock().await;
            self.dirty.store(false, Ordering::Release);
        }

        let containers = runtime.active_containers().await?;
        info!("Found {} running or paused containers", containers.len());

        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut datastore: Option<String> = None;
        for container in &containers {
            if self.is_dirty().await {
                return Err(VdvsError::Busy("refcounting wasn't clean.".to_string()));
            }
            let mounts = runtime.container_mounts(&container.id).await?;
            debug!(container = ?container.names, "inspecting mounts");
            for mount in mounts.iter().filter(|m| self.is_managed_source(&m.source)) {
                let name = resolve_name(&mount.name, &mut datastore, lifecycle).await?;
                debug!(name, driver = %mount.driver, source = %mount.source, "volume in use");
                *counts.entry(name).or_default() += 1;
            }
        }

        let _state = self.state.lock().await;
        if self.dirty.load(Ordering::Acquire) {
            return Err(VdvsError::Busy("refcounting wasn't clean.".to_string()));
        }

        let mut rebuilt: HashMap<String, RefEntry> = counts
            .into_iter()
            .map(|(name, count)| {
                (
                    name,
                    RefEntry {
                        count,
                        ..Default::default()
                    },
                )
            })
            .collect();
        for (name, device) in table.mounted_volumes(&self.mount_root)? {
            debug!(name, device, "found in mount table");
            let entry = rebuilt.entry(name).or_default();
            entry.mounted = true;
            entry.device = device;
        }

        self.sync_mounts(&mut rebuilt, table, lifecycle).await?;

        info!("Discovered {} volumes in use.", rebuilt.len());
        for (name, entry) in &rebuilt {
            info!(
                "Volume name={} count={} mounted={} device='{}'",
                name, entry.count, entry.mounted, entry.device
            );
        }
        *self.entries.lock() = rebuilt;
        self.initialized.store(true, Ordering::Release);
        info!("Refcounting successfully completed");
        Ok(())
    }

    async fn sync_mounts(
        &self,
        entries: &mut HashMap<String, RefEntry>,
        table: &dyn MountTable,
        lifecycle: &dyn VolumeLifecycle,
    ) -> Result<()> {
        let names: Vec<String> = entries.keys().cloned().collect();
        for name in names {
            let Some(entry) = entries.get(&name).cloned() else {
                continue;
            };
            match (entry.mounted, entry.count) {
                (true, 0) => {
                    info!(name, device = %entry.device, "Initiating recovery unmount.");
                    if let Err(e) = lifecycle.unmount_volume(&name).await {
                        warn!(name, error = %e, "Failed to unmount - manual recovery may be needed");
                    }
                    entries.remove(&name);
                }
                (false, 0) => {
                    return Err(VdvsError::Internal(format!(
                        "Internal failure: record should not exist. name={}",
                        name
                    )));
                }
                (false, count) => {
                    warn!(name, count, "Initiating recovery mount.");
                    let status = match lifecycle.get_volume(&name).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(name, error = %e, "Failed to mount - manual recovery may be needed");
                            continue;
                        }
                    };
                    let fstype = status
                        .get("fstype")
                        .and_then(Value::as_str)
                        .unwrap_or(DEFAULT_FSTYPE);
                    let read_only = status
                        .get("access")
                        .and_then(Value::as_str)
                        .map(|a| a == Access::ReadOnly.as_str())
                        .unwrap_or(false);
                    match lifecycle.mount_volume(&name, fstype, read_only).await {
                        Ok(_) => {
                            let device = table
                                .mounted_volumes(&self.mount_root)
                                .ok()
                                .and_then(|mut m| m.remove(&name));
                            if device.is_none() {
                                warn!(name, "Recovery mount not found in the mount table");
                            }
                            if let Some(e) = entries.get_mut(&name) {
                                e.mounted = true;
                                e.device = device.unwrap_or_default();
                            }
                        }
                        Err(e) => {
                            warn!(name, error = %e, "Failed to mount - manual recovery may be needed")
                        }
                    }
                }
                (true, _) => {}
            }
        }
        Ok(())
    }

    /// Runs reconciliation until it succeeds, backing off between attempts.
    ///
    /// Gives up after the policy's attempts, leaving the map uninitialized.
    pub async fn run_reconciler(
        self: Arc<Self>,
        runtime: Arc<dyn ContainerRuntime>,
        table: Arc<dyn MountTable>,
        lifecycle: Arc<dyn VolumeLifecycle>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) {
        match self.reconcile(runtime.as_ref(), table.as_ref(), lifecycle.as_ref()).await {
            Ok(()) => return,
            Err(e) => info!("Refcounting failed: ({}).", e),
        }

        let mut delay = policy.first_delay;
        let mut attempts_left = policy.attempts;
        while attempts_left > 0 {
            info!("Scheduling again after {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.reconcile(runtime.as_ref(), table.as_ref(), lifecycle.as_ref()).await {
                Ok(()) => return,
                Err(e) => {
                    info!("Refcounting failed: ({}). Attempts left: {}", e, attempts_left);
                    attempts_left -= 1;
                    delay *= 2;
                }
            }
        }
        error!("Failed to talk to docker to calculate volumes usage. Please restart docker");
    }
}

/// Full name of a volume seen in a container mount. The datastore of the
/// first resolved short name is reused for the rest of the pass.
async fn resolve_name(
    name: &str,
    datastore: &mut Option<String>,
    lifecycle: &dyn VolumeLifecycle,
) -> Result<String> {
    if is_full_name(name) {
        return Ok(name.to_string());
    }
    if let Some(ds) = datastore.as_deref() {
        return Ok(make_full_name(name, ds));
    }
    let status = lifecycle.get_volume(name).await.map_err(|e| {
        error!(name, error = %e, "Unable to get volume info");
        e
    })?;
    match status.get("datastore").and_then(Value::as_str) {
        Some(ds) if !ds.is_empty() => {
            *datastore = Some(ds.to_string());
            Ok(make_full_name(name, ds))
        }
        _ => Ok(name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::{parse_mounts, MountEntry};
    use crate::runtime::{ContainerMount, ContainerSummary};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct FakeRuntime {
        containers: Vec<(String, Vec<&'static str>)>,
        fail_list: AtomicU32,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn active_containers(&self) -> Result<Vec<ContainerSummary>> {
            if self.fail_list.load(Ordering::SeqCst) > 0 {
                self.fail_list.fetch_sub(1, Ordering::SeqCst);
                return Err(VdvsError::Transport("engine down".into()));
            }
            Ok(self
                .containers
                .iter()
                .map(|(id, _)| ContainerSummary {
                    id: id.clone(),
                    names: vec![format!("/{}", id)],
                    state: "running".into(),
                })
                .collect())
        }

        async fn container_mounts(&self, id: &str) -> Result<Vec<ContainerMount>> {
            let (_, sources) = self
                .containers
                .iter()
                .find(|(c, _)| c == id)
                .ok_or_else(|| VdvsError::NotFound(id.to_string()))?;
            Ok(sources
                .iter()
                .map(|s| ContainerMount {
                    name: s.rsplit('/').next().unwrap_or_default().to_string(),
                    source: s.to_string(),
                    destination: "/data".into(),
                    driver: "vsphere".into(),
                })
                .collect())
        }
    }

    struct FixedTable(Vec<MountEntry>);

    impl MountTable for FixedTable {
        fn entries(&self) -> Result<Vec<MountEntry>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        mounted: Mutex<Vec<(String, String, bool)>>,
        unmounted: Mutex<Vec<String>>,
        table: Mutex<Vec<MountEntry>>,
    }

    impl MountTable for Recorder {
        fn entries(&self) -> Result<Vec<MountEntry>> {
            Ok(self.table.lock().clone())
        }
    }

    #[async_trait]
    impl VolumeLifecycle for Recorder {
        async fn get_volume(&self, name: &str) -> Result<HashMap<String, Value>> {
            let mut status = HashMap::new();
            status.insert("datastore".to_string(), json!("ds1"));
            status.insert("fstype".to_string(), json!("xfs"));
            if name.starts_with("ro") {
                status.insert("access".to_string(), json!("read-only"));
            }
            Ok(status)
        }

        async fn mount_volume(&self, name: &str, fstype: &str, read_only: bool) -> Result<PathBuf> {
            self.mounted
                .lock()
                .push((name.to_string(), fstype.to_string(), read_only));
            let target = PathBuf::from("/mnt/vmdk").join(name);
            let mut table = self.table.lock();
            let idx = table.len();
            table.push(MountEntry {
                device: format!("/dev/sd{}", (b'd' + idx as u8) as char),
                target: target.clone(),
                fstype: fstype.to_string(),
                options: "rw".into(),
            });
            Ok(target)
        }

        async fn unmount_volume(&self, name: &str) -> Result<()> {
            self.unmounted.lock().push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_incr_decr() {
        let map = RefCountsMap::new("/mnt/vmdk");
        assert_eq!(map.incr("v@ds"), 1);
        assert_eq!(map.incr("v@ds"), 2);
        assert_eq!(map.decr("v@ds").unwrap(), 1);
        assert_eq!(map.decr("v@ds").unwrap(), 0);
        assert!(map.snapshot().is_empty());
        let err = map.decr("v@ds").unwrap_err();
        assert_eq!(err.to_string(), "Decr: Missing refcount. name=v@ds");
    }

    #[test]
    fn test_get_sentinel_before_init() {
        let map = RefCountsMap::new("/mnt/vmdk");
        assert_eq!(map.get("anything"), 1);
        map.initialized.store(true, Ordering::Release);
        assert_eq!(map.get("anything"), 0);
        map.incr("anything");
        assert_eq!(map.get("anything"), 1);
    }

    #[test]
    fn test_managed_source() {
        let map = RefCountsMap::new("/mnt/vmdk");
        assert!(map.is_managed_source("/mnt/vmdk/vol1@ds"));
        assert!(map.is_managed_source(
            "/var/lib/docker/plugins/abc123/rootfs/mnt/vmdk/vol1@ds"
        ));
        assert!(!map.is_managed_source("/var/lib/docker/volumes/x/_data"));
        assert!(!map.is_managed_source("/var/lib/docker/plugins/abc/other"));
    }

    #[tokio::test]
    async fn test_reconcile_counts_and_repairs() {
        let runtime = FakeRuntime {
            containers: vec![
                ("c1".into(), vec!["/mnt/vmdk/vol1@ds1", "/var/lib/docker/volumes/x"]),
                ("c2".into(), vec!["/mnt/vmdk/vol1@ds1", "/mnt/vmdk/ro_vol"]),
            ],
            ..Default::default()
        };
        let table = FixedTable(parse_mounts(
            "/dev/sdb /mnt/vmdk/vol1@ds1 ext4 rw 0 0\n/dev/sdc /mnt/vmdk/stale@ds1 ext4 rw 0 0\n",
        ));
        let recorder = Recorder::default();
        let map = RefCountsMap::new("/mnt/vmdk");

        map.reconcile(&runtime, &table, &recorder).await.unwrap();

        assert!(map.is_initialized());
        let snap = map.snapshot();
        assert_eq!(
            snap.get("vol1@ds1"),
            Some(&RefEntry {
                count: 2,
                mounted: true,
                device: "/dev/sdb".into()
            })
        );
        let ro = snap.get("ro_vol@ds1").unwrap();
        assert_eq!(ro.count, 1);
        assert!(ro.mounted);
        assert!(!snap.contains_key("stale@ds1"));

        assert_eq!(*recorder.unmounted.lock(), vec!["stale@ds1".to_string()]);
        assert_eq!(
            *recorder.mounted.lock(),
            vec![("ro_vol@ds1".to_string(), "xfs".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_recovery_mount_records_device() {
        let runtime = FakeRuntime {
            containers: vec![("c1".into(), vec!["/mnt/vmdk/vol2@ds1"])],
            ..Default::default()
        };
        let recorder = Recorder::default();
        let map = RefCountsMap::new("/mnt/vmdk");

        map.reconcile(&runtime, &recorder, &recorder).await.unwrap();

        assert_eq!(
            map.snapshot().get("vol2@ds1"),
            Some(&RefEntry {
                count: 1,
                mounted: true,
                device: "/dev/sdd".into()
            })
        );
    }

    #[tokio::test]
    async fn test_reconcile_aborts_when_dirty() {
        struct DirtyingRuntime<'a> {
            map: &'a RefCountsMap,
        }

        #[async_trait]
        impl ContainerRuntime for DirtyingRuntime<'_> {
            async fn active_containers(&self) -> Result<Vec<ContainerSummary>> {
                self.map.mark_dirty();
                Ok(vec![ContainerSummary {
                    id: "c1".into(),
                    ..Default::default()
                }])
            }

            async fn container_mounts(&self, _id: &str) -> Result<Vec<ContainerMount>> {
                Ok(vec![])
            }
        }

        let map = RefCountsMap::new("/mnt/vmdk");
        let runtime = DirtyingRuntime { map: &map };
        let err = map
            .reconcile(&runtime, &FixedTable(vec![]), &Recorder::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("wasn't clean"));
        assert!(!map.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_retries_with_backoff() {
        let runtime = Arc::new(FakeRuntime {
            fail_list: AtomicU32::new(2),
            ..Default::default()
        });
        let map = Arc::new(RefCountsMap::new("/mnt/vmdk"));
        let start = tokio::time::Instant::now();
        map.clone()
            .run_reconciler(
                runtime,
                Arc::new(FixedTable(vec![])),
                Arc::new(Recorder::default()),
                RetryPolicy::default(),
                CancellationToken::new(),
            )
            .await;
        assert!(map.is_initialized());
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_gives_up() {
        let runtime = Arc::new(FakeRuntime {
            fail_list: AtomicU32::new(100),
            ..Default::default()
        });
        let map = Arc::new(RefCountsMap::new("/mnt/vmdk"));
        map.clone()
            .run_reconciler(
                runtime,
                Arc::new(FixedTable(vec![])),
                Arc::new(Recorder::default()),
                RetryPolicy {
                    first_delay: Duration::from_millis(10),
                    attempts: 3,
                },
                CancellationToken::new(),
            )
            .await;
        assert!(!map.is_initialized());
    }
}
