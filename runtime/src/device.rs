// device.rs — Device specifications: parsing, merging and canonical form
//
// Accepts the full form `/job:ps/replica:0/task:1/device:GPU:0` as well as the
// legacy shorthands `/cpu:0` and `/gpu:1`. Canonical output always spells the
// device component as `device:TYPE:index`.
//
// Preconditions: none.
// Postconditions: `canonicalize(canonicalize(s)) == canonicalize(s)`.
// Failure modes: malformed components → `Error::InvalidDevice`.
// Side effects: none.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSpec {
    pub job: Option<String>,
    pub replica: Option<u32>,
    pub task: Option<u32>,
    pub device_type: Option<String>,
    /// `None` together with a device type means "any index" (`*`).
    pub device_index: Option<u32>,
}

impl DeviceSpec {
    pub fn parse(spec: &str) -> Result<DeviceSpec> {
        let invalid = || Error::InvalidDevice {
            spec: spec.to_string(),
        };
        let mut out = DeviceSpec::default();
        for part in spec.split('/').filter(|p| !p.is_empty()) {
            let fields: Vec<&str> = part.split(':').collect();
            match fields.as_slice() {
                ["job", name] if !name.is_empty() => out.job = Some(name.to_string()),
                ["replica", n] => out.replica = Some(n.parse().map_err(|_| invalid())?),
                ["task", n] => out.task = Some(n.parse().map_err(|_| invalid())?),
                ["device", ty, idx] if !ty.is_empty() => {
                    out.device_type = Some(ty.to_ascii_uppercase());
                    out.device_index = parse_index(idx).ok_or_else(invalid)?;
                }
                ["device", ty] if !ty.is_empty() => {
                    out.device_type = Some(ty.to_ascii_uppercase());
                }
                [ty, idx] if ty.eq_ignore_ascii_case("cpu") || ty.eq_ignore_ascii_case("gpu") => {
                    out.device_type = Some(ty.to_ascii_uppercase());
                    out.device_index = parse_index(idx).ok_or_else(invalid)?;
                }
                _ => return Err(invalid()),
            }
        }
        Ok(out)
    }

    /// Overwrite every field that `other` sets.
    pub fn merge_from(&mut self, other: &DeviceSpec) {
        if other.job.is_some() {
            self.job = other.job.clone();
        }
        if other.replica.is_some() {
            self.replica = other.replica;
        }
        if other.task.is_some() {
            self.task = other.task;
        }
        if other.device_type.is_some() {
            if self.device_type != other.device_type {
                self.device_index = None;
            }
            self.device_type = other.device_type.clone();
        }
        if other.device_index.is_some() {
            self.device_index = other.device_index;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == DeviceSpec::default()
    }
}

fn parse_index(s: &str) -> Option<Option<u32>> {
    if s == "*" {
        Some(None)
    } else {
        s.parse().ok().map(Some)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "/job:{}", job)?;
        }
        if let Some(r) = self.replica {
            write!(f, "/replica:{}", r)?;
        }
        if let Some(t) = self.task {
            write!(f, "/task:{}", t)?;
        }
        if let Some(ty) = &self.device_type {
            match self.device_index {
                Some(i) => write!(f, "/device:{}:{}", ty, i)?,
                None => write!(f, "/device:{}:*", ty)?,
            }
        }
        Ok(())
    }
}

/// Canonical string form of a device specification. Empty stays empty.
pub fn canonicalize(spec: &str) -> Result<String> {
    Ok(DeviceSpec::parse(spec)?.to_string())
}

/// Merge `node` over `ambient`: fields set on the node win.
pub fn merge_device(ambient: &str, node: &str) -> Result<String> {
    let mut merged = DeviceSpec::parse(ambient)?;
    merged.merge_from(&DeviceSpec::parse(node)?);
    Ok(merged.to_string())
}
