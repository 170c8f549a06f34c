//! Shared fixtures for memforge integration tests
//!
//! Every fixture builds its own pool manager, so tests never share arenas
//! and can run in parallel. Only tests that touch process environment
//! variables need `#[serial]`.

#![allow(dead_code)]

mod tempfile_helpers;

use std::collections::BTreeMap;
use std::sync::Arc;

use memforge::monitor::PressureThresholds;
use memforge::{
    AutomaticOffloader, CacheConfig, Device, ManualClock, MemoryMonitor, MemoryPoolManager,
    ModelWeightCache, MonitorConfig, OffloaderConfig, StaticDeviceBackend,
};
pub use serial_test::serial;
pub use tempfile_helpers::*;

pub const GPU: Device = Device::Gpu(0);
pub const CPU: Device = Device::Cpu;
pub const KIB: usize = 1024;

/// Pool manager with one GPU and one CPU pool, 256-byte alignment
pub fn pools(gpu_bytes: usize, cpu_bytes: usize) -> Arc<MemoryPoolManager> {
    let mut sizes = BTreeMap::new();
    sizes.insert(GPU, gpu_bytes as u64);
    sizes.insert(CPU, cpu_bytes as u64);
    Arc::new(MemoryPoolManager::new(&sizes, 256).expect("valid pool sizes"))
}

/// Deterministic, layer-specific payload so copies can be compared
pub fn weights(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Cache, monitor and offloader over small pools, driven by a manual clock
pub struct OffloadFixture {
    pub clock: Arc<ManualClock>,
    pub backend: Arc<StaticDeviceBackend>,
    pub pools: Arc<MemoryPoolManager>,
    pub cache: Arc<ModelWeightCache>,
    pub monitor: Arc<MemoryMonitor>,
    pub offloader: AutomaticOffloader,
}

impl OffloadFixture {
    /// 64 KiB GPU pool, `cpu_bytes` CPU pool, 48 KiB cache budget
    pub fn new(cpu_bytes: usize) -> Self {
        Self::with_config(cpu_bytes, OffloaderConfig::default())
    }

    pub fn with_config(cpu_bytes: usize, config: OffloaderConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let backend = Arc::new(StaticDeviceBackend::new());
        let pools = pools(64 * KIB, cpu_bytes);
        let cache = Arc::new(
            ModelWeightCache::new(CacheConfig::new(48 * KIB).with_device(GPU), Arc::clone(&pools))
                .expect("cache")
                .with_clock(clock.clone()),
        );
        let monitor = Arc::new(
            MemoryMonitor::new(MonitorConfig {
                thresholds: PressureThresholds::default(),
                history_size: 16,
                max_alerts: 16,
            })
            .with_source(backend.clone())
            .with_clock(clock.clone()),
        );
        let offloader = AutomaticOffloader::new(
            config.with_offload_device(CPU),
            Arc::clone(&cache),
            Arc::clone(&monitor),
        )
        .with_clock(clock.clone());

        Self {
            clock,
            backend,
            pools,
            cache,
            monitor,
            offloader,
        }
    }

    /// Register a model on the GPU and cache `layers` layers of `size` bytes
    pub fn load_model(&self, model: &str, layers: usize, size: usize) {
        self.offloader.register_model(model, GPU).expect("register");
        for i in 0..layers {
            self.cache
                .put(model, &format!("layers.{}", i), &weights(size, i as u8))
                .expect("put");
        }
    }

    /// Report GPU usage to the monitor as a ratio of 1,000,000 bytes
    pub fn set_gpu_ratio(&self, ratio: f64) {
        self.backend
            .set_usage(GPU, (ratio * 1_000_000.0) as u64, 1_000_000);
    }
}
