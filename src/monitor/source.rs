//! Memory usage sources
//!
//! The monitor does not know where its numbers come from. Pools report their
//! arena usage; a device backend reports the raw counters the driver exposes.
//! Both implement [`MemoryUsageSource`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::device::Device;

/// Raw usage of one device as seen by one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUsage {
    pub device: Device,
    pub used_bytes: u64,
    pub total_bytes: u64,
    /// Free-space fragmentation, when the source can tell
    pub fragmentation: Option<f64>,
}

impl DeviceUsage {
    pub fn usage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// Anything that can report device memory usage
pub trait MemoryUsageSource: Send + Sync {
    /// Short label used in stats and logs
    fn name(&self) -> &str;

    /// Current usage for every device this source knows about
    fn sample(&self) -> Vec<DeviceUsage>;
}

/// Device backend with externally set counters
///
/// Stands in for a driver query (e.g. `hipMemGetInfo`). Serving code or
/// tests update the counters; the monitor reads them on every sample.
#[derive(Debug, Default)]
pub struct StaticDeviceBackend {
    counters: RwLock<BTreeMap<Device, (u64, u64)>>,
}

impl StaticDeviceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set used/total bytes for a device
    pub fn set_usage(&self, device: Device, used_bytes: u64, total_bytes: u64) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters.insert(device, (used_bytes.min(total_bytes), total_bytes));
    }

    /// Stop reporting a device
    pub fn clear(&self, device: Device) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters.remove(&device);
    }
}

impl MemoryUsageSource for StaticDeviceBackend {
    fn name(&self) -> &str {
        "device-backend"
    }

    fn sample(&self) -> Vec<DeviceUsage> {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        counters
            .iter()
            .map(|(&device, &(used, total))| DeviceUsage {
                device,
                used_bytes: used,
                total_bytes: total,
                fragmentation: None,
            })
            .collect()
    }
}
