//! Device identifiers
//!
//! A device is either host memory or a numbered accelerator. The textual
//! form (`cpu`, `gpu:0`, `gpu:1`, ...) is used in configuration files and
//! log output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MemForgeError;

/// Memory tier a pool lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    /// Host memory
    Cpu,
    /// Accelerator memory, by ordinal
    Gpu(u32),
}

impl Device {
    /// Whether this device is host memory
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(idx) => write!(f, "gpu:{}", idx),
        }
    }
}

impl FromStr for Device {
    type Err = MemForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "cpu" | "host" => return Ok(Device::Cpu),
            "gpu" | "cuda" | "hip" => return Ok(Device::Gpu(0)),
            _ => {}
        }

        let index = lower
            .strip_prefix("gpu:")
            .or_else(|| lower.strip_prefix("cuda:"))
            .or_else(|| lower.strip_prefix("hip:"))
            .ok_or_else(|| MemForgeError::InvalidConfiguration(format!("unknown device '{}'", s)))?;

        index
            .parse::<u32>()
            .map(Device::Gpu)
            .map_err(|_| MemForgeError::InvalidConfiguration(format!("invalid device ordinal in '{}'", s)))
    }
}

impl TryFrom<String> for Device {
    type Error = MemForgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Gpu(0).to_string(), "gpu:0");
        assert_eq!(Device::Gpu(3).to_string(), "gpu:3");
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("HOST".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("gpu".parse::<Device>().unwrap(), Device::Gpu(0));
        assert_eq!("gpu:2".parse::<Device>().unwrap(), Device::Gpu(2));
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Gpu(1));
        assert!("tpu:0".parse::<Device>().is_err());
        assert!("gpu:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_as_json_map_key() {
        let mut sizes = BTreeMap::new();
        sizes.insert(Device::Gpu(0), 1024u64);
        sizes.insert(Device::Cpu, 4096u64);

        let json = serde_json::to_string(&sizes).unwrap();
        assert_eq!(json, r#"{"cpu":4096,"gpu:0":1024}"#);

        let back: BTreeMap<Device, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sizes);
    }

    #[test]
    fn test_device_ordering_puts_cpu_first() {
        let mut devices = vec![Device::Gpu(1), Device::Cpu, Device::Gpu(0)];
        devices.sort();
        assert_eq!(devices, vec![Device::Cpu, Device::Gpu(0), Device::Gpu(1)]);
    }
}
