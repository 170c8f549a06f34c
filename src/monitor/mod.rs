//! Memory monitoring and pressure detection
//!
//! - [`source`] - usage sources (pools, device backends)
//! - [`pressure`] - pressure levels and hysteresis thresholds
//! - [`memory_monitor`] - the sampling monitor with bounded usage history

pub mod memory_monitor;
pub mod pressure;
pub mod source;

pub use memory_monitor::{
    DeviceMemoryStats, MemoryMonitor, MemoryStats, MonitorConfig, PressureAlert, UsageRecord,
};
pub use pressure::{MemoryPressure, PressureThresholds};
pub use source::{DeviceUsage, MemoryUsageSource, StaticDeviceBackend};
