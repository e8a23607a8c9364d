use std::path::PathBuf;

use clap::Parser;

use vdvs_core::config::{
    Overrides, DEFAULT_ESX_PORT, DEFAULT_VFILE_CONFIG_PATH, DEFAULT_VFILE_LOG_PATH,
    DEFAULT_VMDK_CONFIG_PATH, DEFAULT_VMDK_LOG_PATH,
};
use vdvs_core::DriverKind;

#[derive(Parser, Debug, Clone)]
#[command(name = "vdvs-plugin")]
#[command(about = "vSphere volume plugin for the container runtime", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Volume driver
    #[arg(long)]
    pub driver: Option<String>,

    /// Logging level
    #[arg(long = "log_level")]
    pub log_level: Option<String>,

    /// Plugin socket group id
    #[arg(long)]
    pub group: Option<String>,

    /// Driver which creates internal volumes
    #[arg(long = "InternalDriver")]
    pub internal_driver: Option<String>,

    /// Port to connect to the ESX service
    #[arg(long, default_value_t = DEFAULT_ESX_PORT)]
    pub port: u32,

    /// Mock the ESX service
    #[arg(long = "mock_esx")]
    pub mock_esx: bool,
}

impl Cli {
    /// The driver family the defaults are picked for: file volumes when
    /// `--driver vfile` is given, block volumes otherwise.
    pub fn default_driver(&self) -> DriverKind {
        match self.driver.as_deref() {
            Some("vfile") => DriverKind::VFile,
            _ => DriverKind::VSphere,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        match (&self.config, self.default_driver()) {
            (Some(path), _) => path.clone(),
            (None, DriverKind::VFile) => PathBuf::from(DEFAULT_VFILE_CONFIG_PATH),
            (None, _) => PathBuf::from(DEFAULT_VMDK_CONFIG_PATH),
        }
    }

    pub fn default_log_path(&self) -> &'static str {
        match self.default_driver() {
            DriverKind::VFile => DEFAULT_VFILE_LOG_PATH,
            _ => DEFAULT_VMDK_LOG_PATH,
        }
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            driver: self.driver.clone(),
            log_level: self.log_level.clone(),
            group: self.group.clone(),
            internal_driver: self.internal_driver.clone(),
        }
    }
}
