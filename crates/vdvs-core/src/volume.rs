//! Volume names and create options.
//!
//! A full volume name has the form `short@datastore`. Create options follow
//! the `key=value` grammar accepted by `docker volume create -o`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, VdvsError};

/// Separator between the short name and the datastore.
pub const DATASTORE_SEPARATOR: char = '@';
/// Longest accepted short name.
pub const MAX_NAME_LEN: usize = 100;
/// Filesystem used when the request does not name one.
pub const DEFAULT_FSTYPE: &str = "ext4";

pub const OPT_SIZE: &str = "size";
pub const OPT_FSTYPE: &str = "fstype";
pub const OPT_DISKFORMAT: &str = "diskformat";
pub const OPT_ACCESS: &str = "access";
pub const OPT_ATTACH_AS: &str = "attach-as";
pub const OPT_CLONE_FROM: &str = "clone-from";
pub const OPT_VSAN_POLICY: &str = "vsan-policy-name";
pub const OPT_FLAVOR: &str = "flavor";

const KNOWN_OPTIONS: &[&str] = &[
    OPT_SIZE,
    OPT_FSTYPE,
    OPT_DISKFORMAT,
    OPT_ACCESS,
    OPT_ATTACH_AS,
    OPT_CLONE_FROM,
    OPT_VSAN_POLICY,
    OPT_FLAVOR,
];

/// Returns true when `name` already carries a datastore.
pub fn is_full_name(name: &str) -> bool {
    name.contains(DATASTORE_SEPARATOR)
}

/// Joins a short name and datastore into a full name.
pub fn make_full_name(short: &str, datastore: &str) -> String {
    format!("{}{}{}", short, DATASTORE_SEPARATOR, datastore)
}

/// Splits a name into `(short, Some(datastore))` or `(short, None)`.
pub fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(DATASTORE_SEPARATOR) {
        Some((short, ds)) => (short, Some(ds)),
        None => (name, None),
    }
}

/// Names are case-insensitive on Windows hosts.
pub fn normalize_name(name: &str) -> String {
    if cfg!(windows) {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

/// Validates a name supplied to `Create`.
pub fn validate_name(name: &str) -> Result<()> {
    let (short, datastore) = split_name(name);
    if short.is_empty() {
        return Err(VdvsError::InvalidArgument(
            "Volume name must not be empty".to_string(),
        ));
    }
    if short.chars().count() > MAX_NAME_LEN {
        return Err(VdvsError::InvalidArgument(format!(
            "Volume name {} is too long, at most {} characters are allowed",
            short, MAX_NAME_LEN
        )));
    }
    if matches!(datastore, Some(ds) if ds.is_empty()) {
        return Err(VdvsError::InvalidArgument(format!(
            "Volume name {} has an empty datastore",
            name
        )));
    }
    if short.contains('/') || short.chars().any(char::is_control) {
        return Err(VdvsError::InvalidArgument(format!(
            "Volume name {} contains invalid characters",
            short
        )));
    }
    let trailing_digits = short.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if trailing_digits == 6 {
        return Err(VdvsError::InvalidArgument(format!(
            "Volume name {} is invalid, names ending in six digits are reserved",
            short
        )));
    }
    Ok(())
}

/// Size unit in the `size=` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Kb,
    Mb,
    Gb,
    Tb,
}

impl SizeUnit {
    fn kb_factor(&self) -> u64 {
        match self {
            SizeUnit::Kb => 1,
            SizeUnit::Mb => 1024,
            SizeUnit::Gb => 1024 * 1024,
            SizeUnit::Tb => 1024 * 1024 * 1024,
        }
    }
}

/// A parsed volume size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeSize {
    pub value: u64,
    pub unit: SizeUnit,
}

impl VolumeSize {
    pub fn in_kb(&self) -> Option<u64> {
        self.value.checked_mul(self.unit.kb_factor())
    }

    pub fn in_mb(&self) -> Option<u64> {
        self.in_kb().map(|kb| kb / 1024)
    }
}

impl FromStr for VolumeSize {
    type Err = VdvsError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            VdvsError::InvalidArgument(format!(
                "Invalid format for size {}. Valid sizes must be of form X[kKmMgGtT]b where X is an integer",
                s
            ))
        };
        if s.len() < 3 || !s.is_ascii() {
            return Err(invalid());
        }
        let (digits, unit) = s.split_at(s.len() - 2);
        let unit = match unit.to_ascii_lowercase().as_str() {
            "kb" => SizeUnit::Kb,
            "mb" => SizeUnit::Mb,
            "gb" => SizeUnit::Gb,
            "tb" => SizeUnit::Tb,
            _ => return Err(invalid()),
        };
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let size = VolumeSize { value, unit };
        let kb = size.in_kb().ok_or_else(invalid)?;
        if value == 0 {
            return Err(invalid());
        }
        if unit == SizeUnit::Kb && kb < SizeUnit::Gb.kb_factor() {
            return Err(VdvsError::InvalidArgument(format!(
                "Invalid size {}: sizes given in kb must amount to at least 1gb",
                s
            )));
        }
        Ok(size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Thin,
    ZeroedThick,
    EagerZeroedThick,
}

impl FromStr for DiskFormat {
    type Err = VdvsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "thin" => Ok(DiskFormat::Thin),
            "zeroedthick" => Ok(DiskFormat::ZeroedThick),
            "eagerzeroedthick" => Ok(DiskFormat::EagerZeroedThick),
            other => Err(VdvsError::InvalidArgument(format!(
                "Invalid diskformat {}. Valid values are thin, zeroedthick, eagerzeroedthick",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::ReadWrite => "read-write",
            Access::ReadOnly => "read-only",
        }
    }

    pub fn is_read_only(&self) -> bool {
        *self == Access::ReadOnly
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Access {
    type Err = VdvsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read-write" => Ok(Access::ReadWrite),
            "read-only" => Ok(Access::ReadOnly),
            other => Err(VdvsError::InvalidArgument(format!(
                "Invalid access type {}. Valid values are read-write, read-only",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachAs {
    Persistent,
    IndependentPersistent,
}

impl FromStr for AttachAs {
    type Err = VdvsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "persistent" => Ok(AttachAs::Persistent),
            "independent_persistent" => Ok(AttachAs::IndependentPersistent),
            other => Err(VdvsError::InvalidArgument(format!(
                "Invalid attach-as {}. Valid values are persistent, independent_persistent",
                other
            ))),
        }
    }
}

/// Validated options of a `Create` request.
///
/// The raw map is kept because it is passed through to the volume service
/// unchanged once validated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateOptions {
    pub size: Option<VolumeSize>,
    pub fstype: Option<String>,
    pub diskformat: Option<DiskFormat>,
    pub access: Option<Access>,
    pub attach_as: Option<AttachAs>,
    pub clone_from: Option<String>,
    pub vsan_policy: Option<String>,
    pub flavor: Option<String>,
    raw: HashMap<String, String>,
}

impl CreateOptions {
    /// Parses and validates the option map. Unknown keys are rejected.
    pub fn parse(opts: &HashMap<String, String>) -> Result<Self> {
        let mut unknown: Vec<&str> = opts
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_OPTIONS.contains(k))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(VdvsError::InvalidArgument(format!(
                "Invalid options: {:?}. Valid options are {:?}",
                unknown, KNOWN_OPTIONS
            )));
        }

        let mut parsed = CreateOptions {
            raw: opts.clone(),
            ..Default::default()
        };
        if let Some(v) = opts.get(OPT_SIZE) {
            parsed.size = Some(v.parse()?);
        }
        if let Some(v) = opts.get(OPT_FSTYPE) {
            if v.is_empty() {
                return Err(VdvsError::InvalidArgument(
                    "fstype must not be empty".to_string(),
                ));
            }
            parsed.fstype = Some(v.clone());
        }
        if let Some(v) = opts.get(OPT_DISKFORMAT) {
            parsed.diskformat = Some(v.parse()?);
        }
        if let Some(v) = opts.get(OPT_ACCESS) {
            parsed.access = Some(v.parse()?);
        }
        if let Some(v) = opts.get(OPT_ATTACH_AS) {
            parsed.attach_as = Some(v.parse()?);
        }
        if let Some(v) = opts.get(OPT_CLONE_FROM) {
            if v.is_empty() {
                return Err(VdvsError::InvalidArgument(
                    "clone-from must name a volume".to_string(),
                ));
            }
            parsed.clone_from = Some(v.clone());
        }
        if let Some(v) = opts.get(OPT_VSAN_POLICY) {
            parsed.vsan_policy = Some(v.clone());
        }
        if let Some(v) = opts.get(OPT_FLAVOR) {
            parsed.flavor = Some(v.clone());
        }
        if parsed.clone_from.is_some() && parsed.fstype.is_some() {
            return Err(VdvsError::InvalidArgument(
                "clone-from cannot be combined with fstype, the clone keeps the source filesystem"
                    .to_string(),
            ));
        }
        Ok(parsed)
    }

    /// Sets the default filesystem unless the volume is a clone.
    pub fn apply_default_fstype(&mut self) {
        if self.fstype.is_none() && self.clone_from.is_none() {
            self.fstype = Some(DEFAULT_FSTYPE.to_string());
            self.raw
                .insert(OPT_FSTYPE.to_string(), DEFAULT_FSTYPE.to_string());
        }
    }

    pub fn is_clone(&self) -> bool {
        self.clone_from.is_some()
    }

    /// Option map to forward to the volume service.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.raw.clone()
    }
}
