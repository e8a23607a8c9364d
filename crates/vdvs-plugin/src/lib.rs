#![warn(missing_docs)]

//! vDVS plugin binary support
//!
//! Command line, logging setup, driver wiring and the volume plugin server
//! on the runtime's Unix socket.

pub mod cli;
pub mod drivers;
pub mod logging;
pub mod server;

pub use cli::Cli;
pub use drivers::{build, HostOptions, Plugin};
pub use server::{router, PluginSocket};
