//! Kernel mount table parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Default location of the kernel mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

/// Decodes the octal escapes (`\040` and friends) used in the mount table.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &bytes[i + 1..i + 4];
            if oct.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let v = oct.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(v) = u8::try_from(v) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses mount table contents. Malformed lines are skipped.
pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                device: unescape(device),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Maps volume name to device for every entry mounted directly below `root`.
pub fn volumes_under(entries: &[MountEntry], root: &Path) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|e| {
            let rest = e.target.strip_prefix(root).ok()?;
            let mut components = rest.components();
            let name = components.next()?.as_os_str().to_str()?.to_string();
            if components.next().is_some() {
                return None;
            }
            Some((name, e.device.clone()))
        })
        .collect()
}

/// Read access to the mount table, so tests can substitute a fixture.
pub trait MountTable: Send + Sync {
    fn entries(&self) -> Result<Vec<MountEntry>>;

    /// Volumes mounted under `root`, keyed by name.
    fn mounted_volumes(&self, root: &Path) -> Result<HashMap<String, String>> {
        Ok(volumes_under(&self.entries()?, root))
    }

    fn is_mounted(&self, name: &str, root: &Path) -> bool {
        self.mounted_volumes(root)
            .map(|m| m.contains_key(name))
            .unwrap_or(false)
    }
}

/// Mount table read from a procfs file.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl ProcMounts {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(PROC_MOUNTS),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable for ProcMounts {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(parse_mounts(&contents))
    }
}
