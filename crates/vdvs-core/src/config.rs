//! Plugin configuration: JSON file, environment overrides and CLI overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, VdvsError};

/// Default port of the hypervisor volume service.
pub const DEFAULT_ESX_PORT: u32 = 1019;
/// Default group owning the plugin socket.
pub const DEFAULT_GROUP_ID: &str = "root";
/// Default config file for the block-volume plugin.
pub const DEFAULT_VMDK_CONFIG_PATH: &str = "/etc/docker-volume-vsphere.conf";
/// Default log file for the block-volume plugin.
pub const DEFAULT_VMDK_LOG_PATH: &str = "/var/log/docker-volume-vsphere.log";
/// Default config file for the file-volume plugin.
pub const DEFAULT_VFILE_CONFIG_PATH: &str = "/etc/vfile.conf";
/// Default log file for the file-volume plugin.
pub const DEFAULT_VFILE_LOG_PATH: &str = "/var/log/vfile.log";
/// Block volumes are mounted under this root.
pub const VMDK_MOUNT_ROOT: &str = "/mnt/vmdk";
/// File volumes are mounted under this root.
pub const VFILE_MOUNT_ROOT: &str = "/mnt/vfile";
/// Directory holding plugin sockets.
pub const PLUGIN_SOCKET_DIR: &str = "/run/docker/plugins";

const DEFAULT_MAX_LOG_SIZE_MB: u32 = 100;
const DEFAULT_MAX_LOG_AGE_DAYS: u32 = 28;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "VDVS_LOG_LEVEL";
/// Environment variable overriding the socket group.
pub const ENV_SOCKET_GID: &str = "VDVS_SOCKET_GID";

/// Volume drivers known to the plugin binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Single-attach block volumes backed by the hypervisor.
    VSphere,
    /// Deprecated name for `VSphere`.
    Vmdk,
    /// Photon platform block volumes.
    Photon,
    /// Shared file volumes.
    VFile,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::VSphere => "vsphere",
            DriverKind::Vmdk => "vmdk",
            DriverKind::Photon => "photon",
            DriverKind::VFile => "vfile",
        }
    }

    /// Mount root used by volumes of this driver.
    pub fn mount_root(&self) -> &'static str {
        match self {
            DriverKind::VFile => VFILE_MOUNT_ROOT,
            _ => VMDK_MOUNT_ROOT,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = VdvsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vsphere" => Ok(DriverKind::VSphere),
            "vmdk" => Ok(DriverKind::Vmdk),
            "photon" => Ok(DriverKind::Photon),
            "vfile" => Ok(DriverKind::VFile),
            other => Err(VdvsError::InvalidArgument(format!(
                "Unknown driver or invalid/missing driver options: {}",
                other
            ))),
        }
    }
}

/// Contents of the plugin configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub driver: String,
    pub internal_driver: String,
    pub log_path: String,
    pub max_log_size_mb: u32,
    pub max_log_age_days: u32,
    pub log_level: String,
    pub target: String,
    pub project: String,
    pub host: String,
    #[serde(rename = "GroupID")]
    pub group_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: String::new(),
            internal_driver: String::new(),
            log_path: String::new(),
            max_log_size_mb: DEFAULT_MAX_LOG_SIZE_MB,
            max_log_age_days: DEFAULT_MAX_LOG_AGE_DAYS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            target: String::new(),
            project: String::new(),
            host: String::new(),
            group_id: String::new(),
        }
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub driver: Option<String>,
    pub log_level: Option<String>,
    pub group: Option<String>,
    pub internal_driver: Option<String>,
}

/// Result of [`Config::resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub config: Config,
    /// True when no config file was found and defaults were used.
    pub using_defaults: bool,
    /// Non-fatal problems met while loading, to be logged once logging is up.
    pub warnings: Vec<String>,
}

impl Config {
    /// Reads and parses a JSON config file, filling zero values with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&contents)?;
        config.set_defaults();
        Ok(config)
    }

    fn set_defaults(&mut self) {
        if self.max_log_size_mb == 0 {
            self.max_log_size_mb = DEFAULT_MAX_LOG_SIZE_MB;
        }
        if self.max_log_age_days == 0 {
            self.max_log_age_days = DEFAULT_MAX_LOG_AGE_DAYS;
        }
        if self.log_level.is_empty() {
            self.log_level = DEFAULT_LOG_LEVEL.to_string();
        }
    }

    /// Builds the effective configuration.
    ///
    /// Precedence for the log level is env, then CLI, then file; for the
    /// socket group it is CLI, then env, then file, then `root`.
    pub fn resolve(
        path: &Path,
        default_driver: DriverKind,
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Resolved {
        let mut warnings = Vec::new();
        let mut using_defaults = false;
        let mut config = match Config::load(path) {
            Ok(config) => config,
            Err(VdvsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                using_defaults = true;
                Config::default()
            }
            Err(e) => {
                warnings.push(format!(
                    "Failed to load config file {}: {}",
                    path.display(),
                    e
                ));
                Config::default()
            }
        };

        if let Some(level) = env(ENV_LOG_LEVEL).filter(|l| !l.is_empty()) {
            config.log_level = level;
        } else if let Some(level) = overrides.log_level.as_ref().filter(|l| !l.is_empty()) {
            config.log_level = level.clone();
        }

        if let Some(driver) = overrides.driver.as_ref().filter(|d| !d.is_empty()) {
            config.driver = driver.clone();
        } else if config.driver.is_empty() {
            config.driver = default_driver.as_str().to_string();
        }

        if let Some(internal) = overrides.internal_driver.as_ref().filter(|d| !d.is_empty()) {
            config.internal_driver = internal.clone();
        } else if config.internal_driver.is_empty() {
            config.internal_driver = DriverKind::VSphere.as_str().to_string();
        }

        if let Some(group) = overrides.group.as_ref().filter(|g| !g.is_empty()) {
            config.group_id = group.clone();
        } else if let Some(group) = env(ENV_SOCKET_GID).filter(|g| !g.is_empty()) {
            config.group_id = group;
        } else if config.group_id.is_empty() {
            config.group_id = DEFAULT_GROUP_ID.to_string();
        }

        Resolved {
            config,
            using_defaults,
            warnings,
        }
    }

    pub fn driver_kind(&self) -> Result<DriverKind> {
        self.driver.parse()
    }

    /// Log file path, falling back to `default` when the config leaves it empty.
    pub fn log_path_or(&self, default: &str) -> PathBuf {
        if self.log_path.is_empty() {
            PathBuf::from(default)
        } else {
            PathBuf::from(&self.log_path)
        }
    }
}

/// Full path of the socket file for a driver.
pub fn socket_path(driver: &str) -> PathBuf {
    Path::new(PLUGIN_SOCKET_DIR).join(format!("{}.sock", driver))
}
