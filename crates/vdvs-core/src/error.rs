//! Error types shared by every vDVS crate.

use thiserror::Error;

/// Message appended to KV errors caused by an exceeded deadline.
pub const CLUSTER_UNHEALTHY: &str = "ETCD maybe unhealthy";

/// Returned by destructive operations until reconciliation has finished.
pub const PLUGIN_INIT_ERROR: &str = "Plugin initialization in progress.";

/// Coarse classification of every failure the plugin can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad request data; no state was changed.
    InvalidArgument,
    /// The named volume or resource does not exist.
    NotFound,
    /// The named volume already exists.
    AlreadyExists,
    /// The caller is not allowed to access the resource.
    AccessDenied,
    /// A tenant quota would be exceeded.
    Quota,
    /// Communication with a remote service failed.
    Transport,
    /// An operation did not finish within its deadline.
    Timeout,
    /// The resource is in use or locked.
    Busy,
    /// Unexpected internal failure.
    Internal,
    /// The plugin has not finished initializing.
    NotInitialized,
    /// The requested filesystem cannot be created on this host.
    UnsupportedFilesystem,
    /// The device node did not show up or cannot be used.
    DeviceNotReady,
}

#[derive(Debug, Error)]
pub enum VdvsError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    Quota(String),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    NotInitialized(String),

    #[error("Not found mkfs for {fstype}. Supported filesystems found: {supported}")]
    UnsupportedFilesystem { fstype: String, supported: String },

    #[error("Device {device} is not ready: {reason}")]
    DeviceNotReady { device: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VdvsError>;

impl VdvsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VdvsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            VdvsError::NotFound(_) => ErrorKind::NotFound,
            VdvsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            VdvsError::AccessDenied(_) => ErrorKind::AccessDenied,
            VdvsError::Quota(_) => ErrorKind::Quota,
            VdvsError::Transport(_) => ErrorKind::Transport,
            VdvsError::Timeout(_) => ErrorKind::Timeout,
            VdvsError::Busy(_) => ErrorKind::Busy,
            VdvsError::Internal(_) => ErrorKind::Internal,
            VdvsError::NotInitialized(_) => ErrorKind::NotInitialized,
            VdvsError::UnsupportedFilesystem { .. } => ErrorKind::UnsupportedFilesystem,
            VdvsError::DeviceNotReady { .. } => ErrorKind::DeviceNotReady,
            VdvsError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
                _ => ErrorKind::Internal,
            },
            VdvsError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Transport and timeout failures may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }

    pub fn not_initialized() -> Self {
        VdvsError::NotInitialized(PLUGIN_INIT_ERROR.to_string())
    }

    /// Classifies an error string returned by the hypervisor volume service.
    pub fn from_service_message(msg: &str) -> Self {
        let lower = msg.to_lowercase();
        let msg = msg.to_string();
        if lower.contains("not found")
            || lower.contains("does not exist")
            || lower.contains("cannot find")
            || lower.contains("no such")
        {
            VdvsError::NotFound(msg)
        } else if lower.contains("already exists") {
            VdvsError::AlreadyExists(msg)
        } else if lower.contains("quota")
            || lower.contains("exceeds")
            || lower.contains("no space")
        {
            VdvsError::Quota(msg)
        } else if lower.contains("no access")
            || lower.contains("not allowed")
            || lower.contains("privilege")
            || lower.contains("permission")
            || lower.contains("denied")
        {
            VdvsError::AccessDenied(msg)
        } else if lower.contains("invalid") || lower.contains("unsupported") {
            VdvsError::InvalidArgument(msg)
        } else if lower.contains("in use") || lower.contains("busy") {
            VdvsError::Busy(msg)
        } else {
            VdvsError::Internal(msg)
        }
    }
}

/// Collapses a multi-line message into the single line the plugin protocol expects.
pub fn single_line(msg: &str) -> String {
    msg.split_whitespace().collect::<Vec<_>>().join(" ")
}
