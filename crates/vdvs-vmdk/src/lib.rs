#![warn(missing_docs)]

//! vDVS block volumes
//!
//! The client for the hypervisor volume service reached over vSocket, an
//! in-memory stand-in for that service, and the block driver that turns
//! volume-plugin requests into create/attach/format/mount sequences.

pub mod driver;
pub mod mock;
pub mod service;
pub mod vmci;

pub use driver::{BlockDriver, VERSION};
pub use mock::MockService;
pub use service::{EsxService, VolumeService, VolumeSummary};
pub use vmci::{Transport, VsockTransport};
