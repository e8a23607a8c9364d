//! File-share servers: one single-replica orchestrator service per mounted
//! file volume, exporting the backing volume over SMB.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use vdvs_core::error::{Result, VdvsError};
use vdvs_core::runtime::{ServiceRuntime, ServiceSpec, ServiceStatus};

use crate::metadata::{internal_volume, VolumeRecord};

pub const SERVICE_PREFIX: &str = "vFileServer";
pub const SERVER_IMAGE: &str = "dperson/samba";
pub const FILE_SHARE: &str = "share1";
pub const SHARE_PATH: &str = "/mount";
pub const SERVER_PORT: u16 = 445;

/// Poll interval and deadline of service start and stop.
#[derive(Debug, Clone, Copy)]
pub struct ServerTimings {
    pub poll: Duration,
    pub timeout: Duration,
}

impl Default for ServerTimings {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

pub fn service_name(volume: &str) -> String {
    format!("{}{}", SERVICE_PREFIX, volume)
}

/// Service definition for a volume's server.
pub fn server_spec(volume: &str, record: &VolumeRecord) -> ServiceSpec {
    let user = &record.username;
    ServiceSpec {
        name: service_name(volume),
        image: SERVER_IMAGE.to_string(),
        args: vec![
            "-s".to_string(),
            format!("{};{};yes;no;no;all;{};{}", FILE_SHARE, SHARE_PATH, user, user),
            "-u".to_string(),
            format!("{};{}", user, record.password),
        ],
        volume_mounts: vec![(internal_volume(volume), SHARE_PATH.to_string())],
        replicas: 1,
        target_port: SERVER_PORT,
    }
}

pub struct FileServers {
    runtime: Arc<dyn ServiceRuntime>,
    timings: ServerTimings,
}

impl FileServers {
    pub fn new(runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self {
            runtime,
            timings: ServerTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ServerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// The server of `volume`, if the orchestrator knows one.
    pub async fn find(&self, volume: &str) -> Result<Option<ServiceStatus>> {
        let name = service_name(volume);
        Ok(self
            .runtime
            .service_list(&name)
            .await?
            .into_iter()
            .find(|s| s.name == name))
    }

    /// Starts the server and waits until it publishes a port and every task
    /// runs. Returns the published port and the service name.
    pub async fn start(&self, volume: &str, record: &VolumeRecord) -> Result<(u16, String)> {
        let spec = server_spec(volume, record);
        let id = self.runtime.service_create(&spec).await.map_err(|e| {
            warn!(volume, error = %e, "Failed to create file server");
            e
        })?;
        info!(volume, service = %spec.name, id, "file server created");

        let mut tick = tokio::time::interval(self.timings.poll);
        tick.tick().await;
        let deadline = tokio::time::sleep(self.timings.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!(volume, "Checking status of file server container...");
                    if let Some(port) = self.running_port(&id, volume).await {
                        info!(volume, port, "file server running");
                        return Ok((port, spec.name));
                    }
                }
                _ = &mut deadline => {
                    warn!(volume, "Timeout reached while waiting for file server container");
                    return Err(VdvsError::Timeout(format!(
                        "File server for volume {} did not start in time",
                        volume
                    )));
                }
            }
        }
    }

    async fn running_port(&self, id: &str, volume: &str) -> Option<u16> {
        let status = match self.find(volume).await {
            Ok(Some(s)) if s.id == id => s,
            Ok(_) => {
                warn!(volume, "No service returned for volume. Service not started properly.");
                return None;
            }
            Err(e) => {
                warn!(volume, error = %e, "Failed to check if file server was started");
                return None;
            }
        };
        if status.published_port == 0 {
            debug!(volume, "port not assigned yet");
            return None;
        }
        match self.runtime.task_states(id).await {
            Ok(states) if !states.is_empty() && states.iter().all(|s| s == "running") => {
                Some(status.published_port)
            }
            Ok(_) => {
                debug!(volume, "File server not running yet");
                None
            }
            Err(e) => {
                warn!(volume, error = %e, "Failed to get task list for file server");
                None
            }
        }
    }

    /// Removes the server and waits until the orchestrator no longer lists
    /// it. A volume without a server is already stopped.
    pub async fn stop(&self, volume: &str) -> Result<()> {
        let Some(status) = self.find(volume).await? else {
            debug!(volume, "no file server to stop");
            return Ok(());
        };
        self.runtime.service_remove(&status.id).await.map_err(|e| {
            warn!(volume, error = %e, "Failed to remove file server");
            e
        })?;

        let mut tick = tokio::time::interval(self.timings.poll);
        let deadline = tokio::time::sleep(self.timings.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.find(volume).await?.is_none() {
                        info!(volume, "file server stopped");
                        return Ok(());
                    }
                }
                _ = &mut deadline => {
                    warn!(volume, "Timeout reached while waiting for file server to stop");
                    return Err(VdvsError::Timeout(format!(
                        "File server for volume {} did not stop in time",
                        volume
                    )));
                }
            }
        }
    }

    /// Volumes that currently have a server.
    pub async fn volumes(&self) -> Result<Vec<String>> {
        Ok(self
            .runtime
            .service_list(SERVICE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|s| s.name.strip_prefix(SERVICE_PREFIX).map(str::to_string))
            .collect())
    }
}
