//! In-guest device I/O: filesystem creation, mounting and device discovery.
//!
//! Nothing in here retries. Callers decide whether a failure is worth
//! another attempt.

use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::mount::{self, MsFlags};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use serde::{Deserialize, Serialize};
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, VdvsError};

/// How long to wait for a device node after attach.
pub const ATTACH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep used instead of the watcher when it cannot be set up.
pub const WATCH_FALLBACK_SLEEP: Duration = Duration::from_secs(1);

/// Directories searched for `mkfs.*` tools.
pub const BIN_SEARCH_PATHS: [&str; 4] = ["/bin", "/sbin", "/usr/bin", "/usr/sbin"];

const MKFS_PREFIX: &str = "mkfs.";

/// Exit status of `mount` when the share server is not reachable yet.
pub const MOUNT_TRANSPORT_EXIT: i32 = 255;

/// Location of an attached disk on the guest's virtual SCSI bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDevSpec {
    #[serde(rename = "Unit")]
    pub unit: String,
    #[serde(rename = "ControllerPciSlotNumber")]
    pub controller_pci_slot: String,
}

/// Parameters of a CIFS mount against a file-share server.
#[derive(Clone, PartialEq, Eq)]
pub struct ShareMount {
    pub host: String,
    pub share: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ShareMount {
    pub fn loopback(port: u16, username: &str, password: &str) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            share: "share1".to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn source(&self) -> String {
        format!("//{}/{}", self.host, self.share)
    }

    fn options(&self) -> String {
        format!(
            "username={},password={},port={},vers=3.0",
            self.username, self.password, self.port
        )
    }
}

impl std::fmt::Debug for ShareMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareMount")
            .field("source", &self.source())
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Maximum label length accepted by `mkfs` for a filesystem type.
pub fn label_limit(fstype: &str) -> usize {
    match fstype {
        "xfs" => 12,
        _ => 16,
    }
}

/// Longest prefix of `label` that `mkfs` accepts for `fstype`.
pub fn fit_label<'a>(fstype: &str, label: &'a str) -> &'a str {
    let limit = label_limit(fstype);
    if label.len() <= limit {
        return label;
    }
    let mut end = limit;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

fn check_label(fstype: &str, label: &str) -> Result<()> {
    let limit = label_limit(fstype);
    if label.len() > limit {
        return Err(VdvsError::InvalidArgument(format!(
            "Volume label {} exceeds the {} byte limit of {}",
            label, limit, fstype
        )));
    }
    Ok(())
}

/// Waits for one device node to appear. Dropping the watch tears it down.
#[async_trait]
pub trait DeviceWatch: Send {
    async fn wait(&mut self, device: &Path, timeout: Duration) -> Result<()>;
}

/// Host-side device and filesystem operations used by the drivers.
#[async_trait]
pub trait DeviceIo: Send + Sync {
    /// Filesystem types that have a `mkfs` tool on this host.
    fn supported_filesystems(&self) -> Vec<String>;

    fn verify_fs_support(&self, fstype: &str) -> Result<()> {
        let supported = self.supported_filesystems();
        if supported.iter().any(|s| s == fstype) {
            Ok(())
        } else {
            Err(VdvsError::UnsupportedFilesystem {
                fstype: fstype.to_string(),
                supported: supported.join(", "),
            })
        }
    }

    async fn mkfs(&self, fstype: &str, label: &str, device: &Path) -> Result<()>;

    /// Creates `path` (mode 0755) unless it already is a directory.
    fn mkdir(&self, path: &Path) -> Result<()>;

    async fn mount(&self, mountpoint: &Path, fstype: &str, device: &Path, read_only: bool)
        -> Result<()>;

    async fn unmount(&self, mountpoint: &Path) -> Result<()>;

    /// Mounts a CIFS share. A transport failure maps to `Transport`.
    async fn mount_share(&self, mountpoint: &Path, share: &ShareMount) -> Result<()>;

    /// Device node path for an attached disk.
    fn device_path(&self, spec: &VolumeDevSpec) -> Result<PathBuf>;

    /// Starts watching for new device nodes. Call before attaching.
    fn prepare_watch(&self) -> Result<Box<dyn DeviceWatch>>;

    /// Waits for `device` through `watch`, or sleeps briefly when no watch
    /// could be prepared.
    async fn attach_wait(&self, watch: Option<Box<dyn DeviceWatch>>, device: &Path) -> Result<()> {
        match watch {
            Some(mut w) => w.wait(device, ATTACH_WAIT_TIMEOUT).await,
            None => {
                tokio::time::sleep(WATCH_FALLBACK_SLEEP).await;
                Ok(())
            }
        }
    }

    /// Removes the stale device node of a detached disk.
    async fn delete_device_path(&self, id: &str) -> Result<()>;
}

/// [`DeviceIo`] against the real host.
///
/// The sysfs and dev roots are configurable so tests can point them at a
/// fixture tree.
#[derive(Debug, Clone)]
pub struct HostDeviceIo {
    sys_root: PathBuf,
    dev_root: PathBuf,
    bin_dirs: Vec<PathBuf>,
}

impl Default for HostDeviceIo {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDeviceIo {
    pub fn new() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            bin_dirs: BIN_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_roots(
        sys_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        bin_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            bin_dirs,
        }
    }

    fn by_path_dir(&self) -> PathBuf {
        self.dev_root.join("disk").join("by-path")
    }

    fn find_mkfs(&self, fstype: &str) -> Option<PathBuf> {
        let tool = format!("{}{}", MKFS_PREFIX, fstype);
        self.bin_dirs
            .iter()
            .map(|dir| dir.join(&tool))
            .find(|path| path.is_file())
    }
}

#[async_trait]
impl DeviceIo for HostDeviceIo {
    fn supported_filesystems(&self) -> Vec<String> {
        let mut found: Vec<String> = self
            .bin_dirs
            .iter()
            .filter_map(|dir| std::fs::read_dir(dir).ok())
            .flat_map(|entries| entries.filter_map(|e| e.ok()))
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix(MKFS_PREFIX))
                    .map(str::to_string)
            })
            .collect();
        found.sort();
        found.dedup();
        found
    }

    async fn mkfs(&self, fstype: &str, label: &str, device: &Path) -> Result<()> {
        check_label(fstype, label)?;
        let tool = self.find_mkfs(fstype).ok_or_else(|| VdvsError::UnsupportedFilesystem {
            fstype: fstype.to_string(),
            supported: self.supported_filesystems().join(", "),
        })?;

        let mut cmd = Command::new(&tool);
        if fstype.starts_with("ext") {
            cmd.arg("-F");
        }
        cmd.arg("-L").arg(label).arg(device);
        debug!(tool = %tool.display(), device = %device.display(), label, "creating filesystem");
        let out = cmd.output().await?;
        if !out.status.success() {
            return Err(VdvsError::Internal(format!(
                "Failed to create filesystem on {}: {}",
                device.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        info!(device = %device.display(), fstype, "filesystem created");
        Ok(())
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(VdvsError::InvalidArgument(format!(
                "{} already exist and it's not a directory",
                path.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(path)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mount(
        &self,
        mountpoint: &Path,
        fstype: &str,
        device: &Path,
        read_only: bool,
    ) -> Result<()> {
        let flags = if read_only {
            MsFlags::MS_RDONLY
        } else {
            MsFlags::empty()
        };
        debug!(device = %device.display(), mountpoint = %mountpoint.display(), fstype, read_only, "mounting");

        let (source, target, fs) = (device.to_path_buf(), mountpoint.to_path_buf(), fstype.to_string());
        let rc = tokio::task::spawn_blocking(move || {
            mount::mount(
                Some(source.as_path()),
                target.as_path(),
                Some(fs.as_str()),
                flags,
                None::<&str>,
            )
        })
        .await
        .map_err(|e| VdvsError::Internal(e.to_string()))?;

        rc.map_err(|e| {
            VdvsError::Internal(format!(
                "Failed to mount device {} at {}: {}",
                device.display(),
                mountpoint.display(),
                e
            ))
        })
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let target = mountpoint.to_path_buf();
        let rc = tokio::task::spawn_blocking(move || mount::umount(target.as_path()))
            .await
            .map_err(|e| VdvsError::Internal(e.to_string()))?;

        rc.map_err(|e| {
            VdvsError::Internal(format!("Failed to unmount {}: {}", mountpoint.display(), e))
        })
    }

    async fn mount_share(&self, mountpoint: &Path, share: &ShareMount) -> Result<()> {
        debug!(share = ?share, mountpoint = %mountpoint.display(), "mounting share");
        let out = Command::new("mount")
            .arg("-t")
            .arg("cifs")
            .arg("-o")
            .arg(share.options())
            .arg(share.source())
            .arg(mountpoint)
            .output()
            .await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        match out.status.code() {
            Some(MOUNT_TRANSPORT_EXIT) => Err(VdvsError::Transport(format!(
                "mount of {} failed with exit status 255: {}",
                share.source(),
                stderr
            ))),
            code => Err(VdvsError::Internal(format!(
                "mount of {} at {} failed ({:?}): {}",
                share.source(),
                mountpoint.display(),
                code,
                stderr
            ))),
        }
    }

    fn device_path(&self, spec: &VolumeDevSpec) -> Result<PathBuf> {
        let address_file = self
            .sys_root
            .join("bus/pci/slots")
            .join(&spec.controller_pci_slot)
            .join("address");
        let address = std::fs::read_to_string(&address_file).map_err(|e| {
            VdvsError::DeviceNotReady {
                device: address_file.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(self.by_path_dir().join(format!(
            "pci-{}.0-scsi-0:0:{}:0",
            address.trim(),
            spec.unit
        )))
    }

    fn prepare_watch(&self) -> Result<Box<dyn DeviceWatch>> {
        Ok(Box::new(InotifyWatch::new(&self.by_path_dir())?))
    }

    async fn delete_device_path(&self, id: &str) -> Result<()> {
        let link = self
            .dev_root
            .join("disk/by-id")
            .join(format!("wwn-0x{}", id.replace('-', "")));
        let target = std::fs::read_link(&link)?;
        let dev = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                VdvsError::Internal(format!("cannot resolve device for {}", link.display()))
            })?;
        let delete = self.sys_root.join("block").join(dev).join("device/delete");
        tokio::fs::write(&delete, b"1").await?;
        info!(device = dev, id, "removed stale device");
        Ok(())
    }
}

/// inotify watch for `IN_CREATE` on one directory.
pub struct InotifyWatch {
    // Dropped before `inotify` so it deregisters before the fd closes.
    ready: AsyncFd<RawFd>,
    inotify: Inotify,
    dir: PathBuf,
}

impl InotifyWatch {
    pub fn new(dir: &Path) -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(io::Error::from)?;
        if let Err(e) = inotify.add_watch(dir, AddWatchFlags::IN_CREATE) {
            warn!(dir = %dir.display(), error = %e, "failed to watch device directory");
            return Err(io::Error::from(e).into());
        }
        Ok(Self {
            ready: AsyncFd::new(inotify.as_fd().as_raw_fd())?,
            inotify,
            dir: dir.to_path_buf(),
        })
    }
}

#[async_trait]
impl DeviceWatch for InotifyWatch {
    async fn wait(&mut self, device: &Path, timeout: Duration) -> Result<()> {
        let (ready, inotify) = (&self.ready, &self.inotify);
        let watched = async {
            loop {
                if device.exists() {
                    return Ok::<(), io::Error>(());
                }
                let mut guard = ready.readable().await?;
                if let Ok(res) = guard.try_io(|_| inotify.read_events().map_err(io::Error::from)) {
                    res?;
                }
            }
        };
        match tokio::time::timeout(timeout, watched).await {
            Ok(Ok(())) => {
                debug!(device = %device.display(), "device node appeared");
                Ok(())
            }
            Ok(Err(e)) => Err(VdvsError::DeviceNotReady {
                device: device.display().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(VdvsError::DeviceNotReady {
                device: device.display().to_string(),
                reason: format!(
                    "not created in {} within {:?}",
                    self.dir.display(),
                    timeout
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, HostDeviceIo) {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("sys");
        let dev = dir.path().join("dev");
        let bin = dir.path().join("bin");
        let sbin = dir.path().join("sbin");
        fs::create_dir_all(sys.join("bus/pci/slots/160")).unwrap();
        fs::write(sys.join("bus/pci/slots/160/address"), "0000:03:00\n").unwrap();
        fs::create_dir_all(dev.join("disk/by-path")).unwrap();
        fs::create_dir_all(dev.join("disk/by-id")).unwrap();
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&sbin).unwrap();
        fs::write(bin.join("mkfs.ext4"), "").unwrap();
        fs::write(sbin.join("mkfs.xfs"), "").unwrap();
        fs::write(sbin.join("mkfs.ext4"), "").unwrap();
        fs::write(sbin.join("fsck"), "").unwrap();
        let io = HostDeviceIo::with_roots(sys, dev, vec![bin, sbin]);
        (dir, io)
    }

    #[test]
    fn test_supported_filesystems() {
        let (_dir, io) = fixture();
        assert_eq!(io.supported_filesystems(), vec!["ext4", "xfs"]);
        assert!(io.verify_fs_support("xfs").is_ok());
        let err = io.verify_fs_support("btrfs").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFilesystem);
        assert!(err.to_string().contains("ext4, xfs"));
    }

    #[test]
    fn test_device_path_from_pci_slot() {
        let (dir, io) = fixture();
        let spec = VolumeDevSpec {
            unit: "1".into(),
            controller_pci_slot: "160".into(),
        };
        assert_eq!(
            io.device_path(&spec).unwrap(),
            dir.path().join("dev/disk/by-path/pci-0000:03:00.0-scsi-0:0:1:0")
        );
        let missing = VolumeDevSpec {
            unit: "0".into(),
            controller_pci_slot: "999".into(),
        };
        assert_eq!(
            io.device_path(&missing).unwrap_err().kind(),
            ErrorKind::DeviceNotReady
        );
    }

    #[test]
    fn test_dev_spec_wire_names() {
        let spec: VolumeDevSpec =
            serde_json::from_str(r#"{"Unit":"2","ControllerPciSlotNumber":"224"}"#).unwrap();
        assert_eq!(spec.unit, "2");
        assert_eq!(spec.controller_pci_slot, "224");
    }

    #[test]
    fn test_mkdir_idempotent_and_rejects_files() {
        let (dir, io) = fixture();
        let target = dir.path().join("mnt/vmdk/vol1");
        io.mkdir(&target).unwrap();
        io.mkdir(&target).unwrap();
        assert!(target.is_dir());

        let file = dir.path().join("plain");
        fs::write(&file, "x").unwrap();
        let err = io.mkdir(&file).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_label_limits() {
        assert_eq!(label_limit("ext4"), 16);
        assert_eq!(label_limit("xfs"), 12);
        assert_eq!(label_limit("btrfs"), 16);
        assert!(check_label("xfs", "twelve_chars").is_ok());
        assert!(check_label("xfs", "thirteen_char").is_err());
        assert!(check_label("ext4", "sixteen_chars_ok").is_ok());
    }

    #[test]
    fn test_fit_label() {
        assert_eq!(fit_label("ext4", "vol1"), "vol1");
        assert_eq!(fit_label("xfs", "a_label_that_is_too_long"), "a_label_that");
        assert_eq!(fit_label("ext4", "a_label_that_is_too_long"), "a_label_that_is_");
        // 'é' is two bytes and would straddle the ext4 limit.
        assert_eq!(fit_label("ext4", "aaaaaaaaaaaaaaaé"), "aaaaaaaaaaaaaaa");
    }

    #[tokio::test]
    async fn test_mkfs_rejects_long_label_and_missing_tool() {
        let (_dir, io) = fixture();
        let dev = Path::new("/dev/null");
        let err = io
            .mkfs("xfs", "a_label_that_is_too_long", dev)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = io.mkfs("btrfs", "vol", dev).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFilesystem);
    }

    #[tokio::test]
    async fn test_mount_failures_name_the_paths() {
        let (dir, io) = fixture();
        let mp = dir.path().join("mnt/vol1");
        io.mkdir(&mp).unwrap();
        let missing = dir.path().join("dev/disk/by-path/missing");
        let err = io.mount(&mp, "ext4", &missing, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().starts_with("Failed to mount device"));
        assert!(err.to_string().contains("missing"));

        let err = io.unmount(&mp).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().starts_with("Failed to unmount"));
    }

    #[tokio::test]
    async fn test_delete_device_path() {
        let (dir, io) = fixture();
        let block = dir.path().join("sys/block/sdb/device");
        fs::create_dir_all(&block).unwrap();
        fs::write(block.join("delete"), "").unwrap();
        std::os::unix::fs::symlink(
            "../../sdb",
            dir.path().join("dev/disk/by-id/wwn-0x6000c29d1a2b"),
        )
        .unwrap();

        io.delete_device_path("6000c29d-1a2b").await.unwrap();
        assert_eq!(fs::read_to_string(block.join("delete")).unwrap(), "1");

        assert!(io.delete_device_path("ffff").await.is_err());
    }

    #[tokio::test]
    async fn test_inotify_watch_sees_new_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = InotifyWatch::new(dir.path()).unwrap();
        let device = dir.path().join("pci-0000:03:00.0-scsi-0:0:1:0");
        let create = device.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(create, "").unwrap();
        });
        watch.wait(&device, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_inotify_watch_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = InotifyWatch::new(dir.path()).unwrap();
        let err = watch
            .wait(&dir.path().join("never"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotReady);
    }

    #[test]
    fn test_watch_on_missing_dir_fails() {
        let io = HostDeviceIo::with_roots("/nonexistent/sys", "/nonexistent/dev", vec![]);
        assert!(io.prepare_watch().is_err());
    }

    #[test]
    fn test_share_mount_hides_password() {
        let share = ShareMount::loopback(30000, "root", "s3cret");
        assert_eq!(share.source(), "//127.0.0.1/share1");
        assert_eq!(
            share.options(),
            "username=root,password=s3cret,port=30000,vers=3.0"
        );
        assert!(!format!("{:?}", share).contains("s3cret"));
    }
}
