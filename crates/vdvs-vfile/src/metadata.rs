//! Per-volume records kept in the cluster store.

use std::fmt;
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use vdvs_core::error::{Result, VdvsError};
use vdvs_kv::{PREFIX_CLIENT, PREFIX_GREF, PREFIX_INFO, PREFIX_STATE};

/// Prefix of the backing volume that holds a file volume's data.
pub const INTERNAL_VOLUME_PREFIX: &str = "_vF_";

/// User the file-share server is configured with.
pub const SHARE_USER: &str = "root";

const PASSWORD_LEN: usize = 16;

/// Value of `gref/<name>` when no host uses the volume.
pub const NO_REFS: &str = "0";

/// Cluster-wide state of a file volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolState {
    Creating,
    Ready,
    Mounting,
    Mounted,
    Unmounting,
    Deleting,
    /// Terminal; only removal leaves it.
    Error,
}

impl VolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolState::Creating => "Creating",
            VolState::Ready => "Ready",
            VolState::Mounting => "Mounting",
            VolState::Mounted => "Mounted",
            VolState::Unmounting => "Unmounting",
            VolState::Deleting => "Deleting",
            VolState::Error => "Error",
        }
    }

    /// States a transition waits out instead of failing on.
    pub fn is_transient(&self) -> bool {
        matches!(self, VolState::Creating | VolState::Unmounting)
    }
}

impl fmt::Display for VolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolState {
    type Err = VdvsError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Creating" => VolState::Creating,
            "Ready" => VolState::Ready,
            "Mounting" => VolState::Mounting,
            "Mounted" => VolState::Mounted,
            "Unmounting" => VolState::Unmounting,
            "Deleting" => VolState::Deleting,
            "Error" => VolState::Error,
            other => {
                return Err(VdvsError::Internal(format!("Unknown volume state {}", other)))
            }
        })
    }
}

pub fn state_key(name: &str) -> String {
    format!("{}{}", PREFIX_STATE, name)
}

pub fn gref_key(name: &str) -> String {
    format!("{}{}", PREFIX_GREF, name)
}

pub fn info_key(name: &str) -> String {
    format!("{}{}", PREFIX_INFO, name)
}

/// Prefix of every client key of a volume.
pub fn client_prefix(name: &str) -> String {
    format!("{}{}_", PREFIX_CLIENT, name)
}

pub fn client_key(name: &str, node_id: &str) -> String {
    format!("{}{}", client_prefix(name), node_id)
}

pub fn internal_volume(name: &str) -> String {
    format!("{}{}", INTERNAL_VOLUME_PREFIX, name)
}

/// Parses a `gref/` value; garbage reads as zero users.
pub fn parse_gref(value: &str) -> u64 {
    value.trim().parse().unwrap_or(0)
}

/// How clients reach a volume's file-share server. Stored as JSON under
/// `info/<name>`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(rename = "serviceName", default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl VolumeRecord {
    /// Record of a new volume with freshly generated share credentials.
    pub fn with_new_credentials() -> Self {
        let password = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self {
            port: 0,
            service_name: String::new(),
            username: SHARE_USER.to_string(),
            password,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| {
            VdvsError::Internal(format!("Failed to unmarshal volume info: {}", e))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Copy pointing at a running server.
    pub fn serving(&self, port: u16, service_name: &str) -> Self {
        Self {
            port,
            service_name: service_name.to_string(),
            ..self.clone()
        }
    }

    /// Copy with the server fields cleared.
    pub fn stopped(&self) -> Self {
        self.serving(0, "")
    }
}

impl fmt::Debug for VolumeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeRecord")
            .field("port", &self.port)
            .field("service_name", &self.service_name)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
