#![warn(missing_docs)]

//! vDVS file volumes
//!
//! Volumes shared by every node of a swarm. Each is a backing volume of an
//! internal block driver, exported by a file-share server that runs only
//! while some node has the volume mounted. Cluster-wide state lives in the
//! KV store; the managers' control plane reacts to global refcount changes.

pub mod control;
pub mod driver;
pub mod fileserver;
pub mod init;
pub mod metadata;

#[cfg(test)]
mod testing;

pub use control::{Control, ControlTimings, Transition};
pub use driver::{DriverTimings, FileDriver, VERSION};
pub use fileserver::{FileServers, ServerTimings};
pub use init::{start_control_plane, BootstrapRetry, PlaneDeps};
pub use metadata::{VolState, VolumeRecord};
