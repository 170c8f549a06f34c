//! memforge - memory management for model serving
//!
//! Four cooperating components, leaves first:
//! - [`monitor`] samples device usage and derives pressure levels with
//!   hysteresis
//! - [`memory`] owns one best-fit arena per device
//! - [`cache`] keeps model layer weights in the arenas under an LRU policy
//! - [`offload`] moves idle models off pressured devices and back
//!
//! [`MemoryManager`] wires them together from a [`MemoryConfig`] and runs
//! the periodic maintenance tick on tokio.

#![allow(clippy::type_complexity)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod monitor;
pub mod offload;

pub use cache::{CacheConfig, CacheKey, CacheStats, EvictionOutcome, ModelWeightCache, WeightCodec};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AlertThresholds, MemoryConfig};
pub use device::Device;
pub use error::{ErrorCategory, ForgeResult, MemForgeError};
pub use manager::{BackgroundHandle, MemoryManager, MemoryManagerBuilder, MemoryReport, TickSummary};
pub use memory::{MemoryBlock, MemoryPoolManager, PoolStats};
pub use metrics::MemoryMetrics;
pub use monitor::{
    DeviceUsage, MemoryMonitor, MemoryPressure, MemoryStats, MemoryUsageSource, MonitorConfig,
    StaticDeviceBackend,
};
pub use offload::{
    AutomaticOffloader, InferenceLease, ModelState, ModelStatus, OffloaderConfig, RestoreOutcome,
};
