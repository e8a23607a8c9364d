#![warn(missing_docs)]

//! vDVS core: shared plumbing for the vSphere volume plugin drivers
//!
//! Errors, configuration, volume-plugin protocol types, in-guest device I/O,
//! the per-host reference-count map with its reconciliation, and the client
//! for the local container engine and swarm orchestrator.

pub mod config;
pub mod device;
pub mod docker;
pub mod error;
pub mod mounts;
pub mod plugin;
pub mod refcount;
pub mod runtime;
pub mod volume;

pub use config::{Config, DriverKind, Overrides, Resolved};
pub use device::{DeviceIo, DeviceWatch, HostDeviceIo, ShareMount, VolumeDevSpec};
pub use docker::DockerClient;
pub use error::{ErrorKind, Result, VdvsError};
pub use mounts::{MountEntry, MountTable, ProcMounts};
pub use plugin::{VolumeDriver, VolumeInfo, VolumeRequest, VolumeResponse};
pub use refcount::{RefCountsMap, RefEntry, RetryPolicy, VolumeLifecycle};
pub use runtime::{
    ContainerRuntime, NodeRole, Orchestrator, ServiceRuntime, ServiceSpec, ServiceStatus,
    SwarmInfo, SwarmPeer, VolumeRuntime,
};
