//! Builds the configured volume driver and its background tasks.

use std::sync::Arc;

use anyhow::bail;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vdvs_core::config::Config;
use vdvs_core::mounts::MountTable;
use vdvs_core::plugin::VolumeDriver;
use vdvs_core::refcount::{RefCountsMap, RetryPolicy, VolumeLifecycle};
use vdvs_core::runtime::ContainerRuntime;
use vdvs_core::{DeviceIo, DockerClient, DriverKind, HostDeviceIo, ProcMounts};
use vdvs_kv::{ClusterSettings, EtcdBackend, EtcdProcess};
use vdvs_vfile::{start_control_plane, BootstrapRetry, FileDriver, PlaneDeps};
use vdvs_vmdk::{BlockDriver, EsxService, MockService, VolumeService, VsockTransport};

/// Options that only exist on the command line.
#[derive(Debug, Clone, Copy)]
pub struct HostOptions {
    pub esx_port: u32,
    pub mock_esx: bool,
}

/// A running driver and the tasks to wait for on shutdown.
pub struct Plugin {
    pub kind: DriverKind,
    pub driver: Arc<dyn VolumeDriver>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Host-side collaborators shared by both drivers.
struct Host {
    docker: Arc<DockerClient>,
    device: Arc<dyn DeviceIo>,
    mounts: Arc<dyn MountTable>,
}

impl Host {
    fn new() -> Self {
        Self {
            docker: Arc::new(DockerClient::default()),
            device: Arc::new(HostDeviceIo::new()),
            mounts: Arc::new(ProcMounts::new()),
        }
    }

    fn reconciler(
        &self,
        refcounts: Arc<RefCountsMap>,
        lifecycle: Arc<dyn VolumeLifecycle>,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let runtime: Arc<dyn ContainerRuntime> = self.docker.clone();
        refcounts.run_reconciler(
            runtime,
            self.mounts.clone(),
            lifecycle,
            RetryPolicy::default(),
            cancel,
        )
    }
}

pub fn build(config: &Config, options: HostOptions, cancel: CancellationToken) -> anyhow::Result<Plugin> {
    let kind = config.driver_kind()?;
    match kind {
        DriverKind::VSphere | DriverKind::Vmdk => {
            if kind == DriverKind::Vmdk {
                warn!("Using deprecated \"vmdk\" driver, use \"vsphere\" driver instead - continuing...");
            }
            Ok(build_block(options, cancel))
        }
        DriverKind::VFile => Ok(build_file(config, cancel)),
        DriverKind::Photon => bail!("Driver {} is not supported by this build", kind),
    }
}

fn build_block(options: HostOptions, cancel: CancellationToken) -> Plugin {
    let host = Host::new();
    let service: Arc<dyn VolumeService> = if options.mock_esx {
        Arc::new(MockService::new())
    } else {
        Arc::new(EsxService::new(VsockTransport::new(options.esx_port)))
    };
    info!(port = options.esx_port, mock_esx = options.mock_esx, "Docker VMDK plugin started");
    let refcounts = Arc::new(RefCountsMap::new(DriverKind::VSphere.mount_root()));
    let driver = Arc::new(BlockDriver::new(
        service,
        host.device.clone(),
        host.mounts.clone(),
        refcounts.clone(),
    ));
    let reconcile = tokio::spawn(host.reconciler(refcounts, driver.clone(), cancel));
    Plugin {
        kind: DriverKind::VSphere,
        driver,
        tasks: vec![reconcile],
    }
}

fn build_file(config: &Config, cancel: CancellationToken) -> Plugin {
    let host = Host::new();
    let refcounts = Arc::new(RefCountsMap::new(DriverKind::VFile.mount_root()));
    let driver = Arc::new(FileDriver::new(
        host.docker.clone(),
        host.docker.clone(),
        host.device.clone(),
        host.mounts.clone(),
        refcounts.clone(),
        &config.internal_driver,
    ));

    let settings = ClusterSettings::from_env(|k| std::env::var(k).ok());
    let etcd = Arc::new(EtcdBackend::new(host.docker.clone(), settings.client_port));
    let deps = PlaneDeps {
        orchestrator: host.docker.clone(),
        kv: etcd.clone(),
        membership: etcd,
        process: Arc::new(EtcdProcess::new()),
        services: host.docker.clone(),
        settings,
    };

    // The runtime gives plugins little time to answer activation, so the
    // KV cluster comes up in the background. Recovery mounts need it.
    let background = {
        let driver = driver.clone();
        let reconcile = host.reconciler(refcounts, driver.clone(), cancel.clone());
        tokio::spawn(async move {
            let cluster =
                match start_control_plane(&driver, deps, BootstrapRetry::default(), cancel.clone()).await {
                    Ok(cluster) => cluster,
                    Err(e) => {
                        error!(error = %e, "vFile control plane did not start");
                        return;
                    }
                };
            reconcile.await;
            cancel.cancelled().await;
            if let Err(e) = cluster.shutdown().await {
                warn!(error = %e, "Failed to stop local KV member");
            }
        })
    };
    Plugin {
        kind: DriverKind::VFile,
        driver,
        tasks: vec![background],
    }
}
