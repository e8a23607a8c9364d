//! Volume plugin protocol types and the driver trait both drivers implement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{single_line, Result};

/// Request body of every `/VolumeDriver.*` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequest {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Opts", alias = "Options", default)]
    pub options: Option<HashMap<String, String>>,
    #[serde(rename = "ID", default)]
    pub id: String,
}

impl VolumeRequest {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(name: &str, id: &str) -> Self {
        Self {
            name: name.to_string(),
            options: None,
            id: id.to_string(),
        }
    }

    pub fn with_options(name: &str, options: HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            options: Some(options),
            id: String::new(),
        }
    }

    pub fn options(&self) -> HashMap<String, String> {
        self.options.clone().unwrap_or_default()
    }
}

/// A volume as reported by `Get` and `List`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint", default, skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(rename = "Status", default, skip_serializing_if = "HashMap::is_empty")]
    pub status: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "Scope")]
    pub scope: String,
}

impl Capability {
    pub fn global() -> Self {
        Self {
            scope: "global".to_string(),
        }
    }
}

/// Response body of every `/VolumeDriver.*` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeResponse {
    #[serde(rename = "Err", default)]
    pub err: String,
    #[serde(rename = "Mountpoint", default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(rename = "Volume", default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeInfo>,
    #[serde(rename = "Volumes", default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeInfo>>,
    #[serde(rename = "Capabilities", default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capability>,
}

impl VolumeResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(msg: impl AsRef<str>) -> Self {
        let mut err = single_line(msg.as_ref());
        if err.is_empty() {
            err = "Unknown error".to_string();
        }
        Self {
            err,
            ..Default::default()
        }
    }

    pub fn mountpoint(path: String) -> Self {
        Self {
            mountpoint: Some(path),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_empty()
    }
}

/// Handshake reply for `/Plugin.Activate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}

impl Default for ActivateResponse {
    fn default() -> Self {
        Self {
            implements: vec!["VolumeDriver".to_string()],
        }
    }
}

/// Operations of the volume plugin API.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Short identification used in logs.
    fn name(&self) -> &str;

    async fn create(&self, req: VolumeRequest) -> Result<()>;

    async fn remove(&self, req: VolumeRequest) -> Result<()>;

    async fn mount(&self, req: VolumeRequest) -> Result<String>;

    async fn unmount(&self, req: VolumeRequest) -> Result<()>;

    async fn get(&self, req: VolumeRequest) -> Result<VolumeInfo>;

    async fn list(&self) -> Result<Vec<VolumeInfo>>;

    async fn path(&self, req: VolumeRequest) -> Result<String>;

    fn capabilities(&self) -> Capability {
        Capability::global()
    }
}

/// Converts a driver result into the wire response.
pub fn respond<T>(result: Result<T>, ok: impl FnOnce(T) -> VolumeResponse) -> VolumeResponse {
    match result {
        Ok(v) => ok(v),
        Err(e) => VolumeResponse::error(e.to_string()),
    }
}
