//! In-memory volume service for tests and `--mock_esx` runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use vdvs_core::device::VolumeDevSpec;
use vdvs_core::error::{Result, VdvsError};
use vdvs_core::volume::{make_full_name, split_name, OPT_ACCESS, OPT_CLONE_FROM, OPT_FSTYPE};

use crate::service::{VolumeService, VolumeSummary, ATTACHED_DEVICE};

pub const MOCK_DATASTORE: &str = "datastore1";
pub const MOCK_VM: &str = "mock-vm";
const MOCK_PCI_SLOT: &str = "160";

#[derive(Debug, Clone)]
struct MockVolume {
    opts: HashMap<String, String>,
    attached_unit: Option<u32>,
}

#[derive(Debug, Default)]
struct MockState {
    volumes: BTreeMap<String, MockVolume>,
    next_unit: u32,
    failures: HashMap<String, String>,
    calls: Vec<String>,
}

/// Volume service that keeps volumes in a map. Names without a datastore
/// land on [`MOCK_DATASTORE`].
#[derive(Debug, Default)]
pub struct MockService {
    state: Mutex<MockState>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `cmd` fail with `message`.
    pub fn fail_next(&self, cmd: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(cmd.to_string(), message.to_string());
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.state
            .lock()
            .volumes
            .get(&full_name(name))
            .map(|v| v.attached_unit.is_some())
            .unwrap_or(false)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(&full_name(name))
    }

    /// Commands received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn begin(&self, cmd: &str) -> Result<parking_lot::MutexGuard<'_, MockState>> {
        let mut state = self.state.lock();
        state.calls.push(cmd.to_string());
        debug!(cmd, "mock volume service");
        if let Some(msg) = state.failures.remove(cmd) {
            return Err(VdvsError::from_service_message(&msg));
        }
        Ok(state)
    }
}

fn full_name(name: &str) -> String {
    match split_name(name) {
        (_, Some(_)) => name.to_string(),
        (short, None) => make_full_name(short, MOCK_DATASTORE),
    }
}

fn not_found(name: &str) -> VdvsError {
    VdvsError::NotFound(format!("Volume {} not found", name))
}

#[async_trait]
impl VolumeService for MockService {
    async fn create(&self, name: &str, opts: &HashMap<String, String>) -> Result<()> {
        let mut state = self.begin("create")?;
        let name = full_name(name);
        if state.volumes.contains_key(&name) {
            return Err(VdvsError::AlreadyExists(format!("Volume {} already exists", name)));
        }
        let mut opts = opts.clone();
        if let Some(src) = opts.get(OPT_CLONE_FROM) {
            let src = state
                .volumes
                .get(&full_name(src))
                .ok_or_else(|| not_found(src))?;
            if let Some(fstype) = src.opts.get(OPT_FSTYPE) {
                opts.insert(OPT_FSTYPE.to_string(), fstype.clone());
            }
        }
        state.volumes.insert(
            name,
            MockVolume {
                opts,
                attached_unit: None,
            },
        );
        Ok(())
    }

    async fn remove(&self, name: &str, _opts: &HashMap<String, String>) -> Result<()> {
        let mut state = self.begin("remove")?;
        let name = full_name(name);
        match state.volumes.get(&name) {
            None => Err(not_found(&name)),
            Some(v) if v.attached_unit.is_some() => Err(VdvsError::Busy(format!(
                "Failed to remove volume {}, it is in use by VM {}",
                name, MOCK_VM
            ))),
            Some(_) => {
                state.volumes.remove(&name);
                Ok(())
            }
        }
    }

    async fn attach(&self, name: &str) -> Result<VolumeDevSpec> {
        let mut state = self.begin("attach")?;
        let name = full_name(name);
        let unit = state.next_unit;
        let vol = state.volumes.get_mut(&name).ok_or_else(|| not_found(&name))?;
        if vol.attached_unit.is_some() {
            return Err(VdvsError::Busy(format!(
                "Volume {} is already attached to VM {}",
                name, MOCK_VM
            )));
        }
        vol.attached_unit = Some(unit);
        state.next_unit += 1;
        Ok(VolumeDevSpec {
            unit: unit.to_string(),
            controller_pci_slot: MOCK_PCI_SLOT.to_string(),
        })
    }

    async fn detach(&self, name: &str) -> Result<()> {
        let mut state = self.begin("detach")?;
        let name = full_name(name);
        let vol = state.volumes.get_mut(&name).ok_or_else(|| not_found(&name))?;
        vol.attached_unit = None;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VolumeSummary>> {
        let state = self.begin("list")?;
        Ok(state
            .volumes
            .keys()
            .map(|name| VolumeSummary {
                name: name.clone(),
                attributes: None,
            })
            .collect())
    }

    async fn get(&self, name: &str) -> Result<HashMap<String, Value>> {
        let state = self.begin("get")?;
        let full = full_name(name);
        let vol = state.volumes.get(&full).ok_or_else(|| not_found(name))?;
        let (_, datastore) = split_name(&full);
        let mut status = HashMap::new();
        status.insert("datastore".to_string(), json!(datastore.unwrap_or(MOCK_DATASTORE)));
        status.insert("created by VM".to_string(), json!(MOCK_VM));
        status.insert(
            "capacity".to_string(),
            json!({"size": vol.opts.get("size").cloned().unwrap_or_else(|| "100MB".to_string()), "allocated": "0MB"}),
        );
        status.insert(
            "diskformat".to_string(),
            json!(vol.opts.get("diskformat").cloned().unwrap_or_else(|| "thin".to_string())),
        );
        status.insert(
            "access".to_string(),
            json!(vol.opts.get(OPT_ACCESS).cloned().unwrap_or_else(|| "read-write".to_string())),
        );
        status.insert(
            "attach-as".to_string(),
            json!(vol.opts.get("attach-as").cloned().unwrap_or_else(|| "independent_persistent".to_string())),
        );
        if let Some(fstype) = vol.opts.get(OPT_FSTYPE) {
            status.insert("fstype".to_string(), json!(fstype));
        }
        if let Some(src) = vol.opts.get(OPT_CLONE_FROM) {
            status.insert("clone-from".to_string(), json!(src));
        }
        match vol.attached_unit {
            Some(unit) => {
                status.insert("status".to_string(), json!("attached"));
                status.insert("attached to VM".to_string(), json!(MOCK_VM));
                status.insert(
                    ATTACHED_DEVICE.to_string(),
                    json!({"Unit": unit.to_string(), "ControllerPciSlotNumber": MOCK_PCI_SLOT}),
                );
            }
            None => {
                status.insert("status".to_string(), json!("detached"));
            }
        }
        Ok(status)
    }

    fn vm_name(&self) -> Option<&str> {
        Some(MOCK_VM)
    }
}
