//! Bring-up of the file volume control plane on one node.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vdvs_core::error::{Result, VdvsError};
use vdvs_core::runtime::{Orchestrator, ServiceRuntime};
use vdvs_kv::{ClusterSettings, KvBackend, KvCluster, KvProcess, KvStore, Membership};

use crate::control::Control;
use crate::driver::FileDriver;
use crate::fileserver::FileServers;

/// Everything the control plane talks to.
pub struct PlaneDeps {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub kv: Arc<dyn KvBackend>,
    pub membership: Arc<dyn Membership>,
    pub process: Arc<dyn KvProcess>,
    pub services: Arc<dyn ServiceRuntime>,
    pub settings: ClusterSettings,
}

/// Managers may come up before the swarm leader has started the cluster,
/// so bootstrap keeps retrying.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapRetry {
    /// `None` retries until cancelled.
    pub attempts: Option<u32>,
    pub delay: Duration,
}

impl Default for BootstrapRetry {
    fn default() -> Self {
        Self {
            attempts: None,
            delay: Duration::from_secs(3),
        }
    }
}

/// Starts or joins the KV cluster, then the gref watcher, the server
/// garbage collector and the role poller, and finally opens the driver
/// for business. The returned cluster is what to shut down on exit.
pub async fn start_control_plane(
    driver: &FileDriver,
    deps: PlaneDeps,
    retry: BootstrapRetry,
    cancel: CancellationToken,
) -> Result<Arc<KvCluster>> {
    let mut attempt = 0;
    let cluster = loop {
        attempt += 1;
        match KvCluster::bootstrap(
            deps.orchestrator.clone(),
            deps.membership.clone(),
            deps.process.clone(),
            deps.settings.clone(),
        )
        .await
        {
            Ok(cluster) => break cluster,
            Err(e) if retry.attempts.map_or(true, |max| attempt < max) => {
                warn!(attempt, error = %e, "Failed to init KV store, retrying");
            }
            Err(e) => return Err(e),
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(VdvsError::NotInitialized("control plane start cancelled".to_string()));
            }
            _ = tokio::time::sleep(retry.delay) => {}
        }
    };

    let store = KvStore::new(deps.kv);
    let control = Arc::new(Control::new(store.clone(), FileServers::new(deps.services)));
    tokio::spawn(control.clone().run_watcher(cluster.subscribe(), cancel.clone()));
    tokio::spawn(control.run_gc(cluster.subscribe(), cancel.clone()));
    tokio::spawn(cluster.clone().run_role_poller(cancel));

    driver.attach_store(store);
    info!(
        node_id = cluster.node_id(),
        manager = cluster.is_manager(),
        "vFile control plane started"
    );
    Ok(cluster)
}
