//! Prometheus-compatible metrics for the memory subsystem
//!
//! Pool and pressure series are labelled by device. Cumulative counters kept
//! by the components are synced into prometheus counters by delta, so calling
//! [`MemoryMetrics::observe_cache`] or [`MemoryMetrics::observe_offloader`]
//! repeatedly never double counts.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus_client::{
    encoding::text::encode,
    metrics::counter::Counter,
    metrics::family::Family,
    metrics::gauge::Gauge,
    metrics::histogram::{exponential_buckets, Histogram},
    registry::Registry,
};

use crate::cache::{CacheStats, MigrationReport};
use crate::device::Device;
use crate::memory::PoolStats;
use crate::monitor::MemoryPressure;
use crate::offload::OffloadCounters;

type DeviceLabels = Vec<(String, String)>;

fn device_labels(device: Device) -> DeviceLabels {
    vec![("device".to_string(), device.to_string())]
}

/// Counter fed from a cumulative total
#[derive(Debug, Default)]
struct SyncedCounter {
    counter: Counter<u64>,
    last: AtomicU64,
}

impl SyncedCounter {
    fn sync(&self, total: u64) {
        let previous = self.last.swap(total, Ordering::Relaxed);
        if total > previous {
            self.counter.inc_by(total - previous);
        }
    }
}

/// Which way a migration went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Offload,
    Restore,
}

/// All memforge metrics behind one registry
#[derive(Debug)]
pub struct MemoryMetrics {
    registry: Registry,

    pool_used_bytes: Family<DeviceLabels, Gauge>,
    pool_capacity_bytes: Family<DeviceLabels, Gauge>,
    pool_largest_free_bytes: Family<DeviceLabels, Gauge>,
    pool_fragmentation: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    pool_live_allocations: Family<DeviceLabels, Gauge>,
    pool_failed_allocations: Family<DeviceLabels, Gauge>,

    memory_pressure: Family<DeviceLabels, Gauge>,

    cache_entries: Gauge,
    cache_used_bytes: Gauge,
    cache_pinned_entries: Gauge,
    cache_hits: SyncedCounter,
    cache_misses: SyncedCounter,
    cache_evictions: SyncedCounter,

    offloads: SyncedCounter,
    restores: SyncedCounter,
    migration_failures: SyncedCounter,
    migration_cancellations: SyncedCounter,
    offload_duration_seconds: Histogram,
    restore_duration_seconds: Histogram,

    tick_duration_seconds: Histogram,
    tick_timeouts: Counter<u64>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let pool_used_bytes = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "memforge_pool_used_bytes",
            "Bytes reserved in the device pool",
            pool_used_bytes.clone(),
        );

        let pool_capacity_bytes = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "memforge_pool_capacity_bytes",
            "Configured capacity of the device pool",
            pool_capacity_bytes.clone(),
        );

        let pool_largest_free_bytes = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "memforge_pool_largest_free_bytes",
            "Largest contiguous free region in the device pool",
            pool_largest_free_bytes.clone(),
        );

        let pool_fragmentation = Family::<DeviceLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "memforge_pool_fragmentation_ratio",
            "Share of free space outside the largest free region",
            pool_fragmentation.clone(),
        );

        let pool_live_allocations = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "memforge_pool_live_allocations",
            "Live blocks in the device pool",
            pool_live_allocations.clone(),
        );

        let pool_failed_allocations = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "memforge_pool_failed_allocations",
            "Allocations rejected with out of memory since start",
            pool_failed_allocations.clone(),
        );

        let memory_pressure = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "memforge_memory_pressure",
            "Pressure level per device (0 normal, 1 warning, 2 critical)",
            memory_pressure.clone(),
        );

        let cache_entries = Gauge::default();
        registry.register(
            "memforge_cache_entries",
            "Layers held by the weight cache",
            cache_entries.clone(),
        );

        let cache_used_bytes = Gauge::default();
        registry.register(
            "memforge_cache_used_bytes",
            "Bytes held by the weight cache",
            cache_used_bytes.clone(),
        );

        let cache_pinned_entries = Gauge::default();
        registry.register(
            "memforge_cache_pinned_entries",
            "Cache layers protected from eviction",
            cache_pinned_entries.clone(),
        );

        let cache_hits = SyncedCounter::default();
        registry.register(
            "memforge_cache_hits",
            "Weight cache hits",
            cache_hits.counter.clone(),
        );

        let cache_misses = SyncedCounter::default();
        registry.register(
            "memforge_cache_misses",
            "Weight cache misses",
            cache_misses.counter.clone(),
        );

        let cache_evictions = SyncedCounter::default();
        registry.register(
            "memforge_cache_evictions",
            "Weight cache evictions",
            cache_evictions.counter.clone(),
        );

        let offloads = SyncedCounter::default();
        registry.register(
            "memforge_offloads",
            "Models moved off their home device",
            offloads.counter.clone(),
        );

        let restores = SyncedCounter::default();
        registry.register(
            "memforge_restores",
            "Models moved back to their home device",
            restores.counter.clone(),
        );

        let migration_failures = SyncedCounter::default();
        registry.register(
            "memforge_migration_failures",
            "Offload or restore attempts that were rolled back",
            migration_failures.counter.clone(),
        );

        let migration_cancellations = SyncedCounter::default();
        registry.register(
            "memforge_migration_cancellations",
            "Offloads cancelled by incoming requests",
            migration_cancellations.counter.clone(),
        );

        // Buckets: 1ms .. 10s
        let offload_duration_seconds = Histogram::new(exponential_buckets(0.001, 10.0, 5));
        registry.register(
            "memforge_offload_duration_seconds",
            "Duration of completed offloads",
            offload_duration_seconds.clone(),
        );

        let restore_duration_seconds = Histogram::new(exponential_buckets(0.001, 10.0, 5));
        registry.register(
            "memforge_restore_duration_seconds",
            "Duration of completed restores",
            restore_duration_seconds.clone(),
        );

        let tick_duration_seconds = Histogram::new(exponential_buckets(0.0001, 10.0, 6));
        registry.register(
            "memforge_tick_duration_seconds",
            "Duration of background maintenance ticks",
            tick_duration_seconds.clone(),
        );

        let tick_timeouts = Counter::default();
        registry.register(
            "memforge_tick_timeouts",
            "Background ticks that exceeded their deadline",
            tick_timeouts.clone(),
        );

        MemoryMetrics {
            registry,
            pool_used_bytes,
            pool_capacity_bytes,
            pool_largest_free_bytes,
            pool_fragmentation,
            pool_live_allocations,
            pool_failed_allocations,
            memory_pressure,
            cache_entries,
            cache_used_bytes,
            cache_pinned_entries,
            cache_hits,
            cache_misses,
            cache_evictions,
            offloads,
            restores,
            migration_failures,
            migration_cancellations,
            offload_duration_seconds,
            restore_duration_seconds,
            tick_duration_seconds,
            tick_timeouts,
        }
    }

    /// Record a pool snapshot
    pub fn observe_pool(&self, stats: &PoolStats) {
        let labels = device_labels(stats.device);
        self.pool_used_bytes
            .get_or_create(&labels)
            .set(stats.used_bytes as i64);
        self.pool_capacity_bytes
            .get_or_create(&labels)
            .set(stats.capacity as i64);
        self.pool_largest_free_bytes
            .get_or_create(&labels)
            .set(stats.largest_free as i64);
        self.pool_fragmentation
            .get_or_create(&labels)
            .set(stats.fragmentation);
        self.pool_live_allocations
            .get_or_create(&labels)
            .set(stats.live_allocations as i64);
        self.pool_failed_allocations
            .get_or_create(&labels)
            .set(stats.failed_allocations as i64);
    }

    pub fn set_pressure(&self, device: Device, pressure: MemoryPressure) {
        self.memory_pressure
            .get_or_create(&device_labels(device))
            .set(pressure.as_i64());
    }

    pub fn observe_cache(&self, stats: &CacheStats) {
        self.cache_entries.set(stats.entries as i64);
        self.cache_used_bytes.set(stats.used_bytes as i64);
        self.cache_pinned_entries.set(stats.pinned_entries as i64);
        self.cache_hits.sync(stats.hits);
        self.cache_misses.sync(stats.misses);
        self.cache_evictions.sync(stats.evictions);
    }

    pub fn observe_offloader(&self, counters: &OffloadCounters) {
        self.offloads.sync(counters.offloads);
        self.restores.sync(counters.restores);
        self.migration_failures.sync(counters.failures);
        self.migration_cancellations.sync(counters.cancellations);
    }

    pub fn record_migration(&self, kind: MigrationKind, report: &MigrationReport) {
        let secs = report.elapsed.as_secs_f64();
        match kind {
            MigrationKind::Offload => self.offload_duration_seconds.observe(secs),
            MigrationKind::Restore => self.restore_duration_seconds.observe(secs),
        }
    }

    pub fn record_tick(&self, duration_sec: f64) {
        self.tick_duration_seconds.observe(duration_sec);
    }

    pub fn record_tick_timeout(&self) {
        self.tick_timeouts.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buffer
    }
}

impl Default for MemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool_stats(device: Device, used: usize) -> PoolStats {
        PoolStats {
            device,
            capacity: 1000,
            used_bytes: used,
            free_bytes: 1000 - used,
            largest_free: 1000 - used,
            fragment_count: 1,
            fragmentation: 0.0,
            live_allocations: 2,
            high_water_mark: used,
            total_allocations: 2,
            failed_allocations: 1,
        }
    }

    #[test]
    fn test_pool_series_labelled_by_device() {
        let metrics = MemoryMetrics::new();
        metrics.observe_pool(&pool_stats(Device::Gpu(0), 800));
        metrics.observe_pool(&pool_stats(Device::Cpu, 100));

        let output = metrics.export();
        assert!(output.contains("memforge_pool_used_bytes{device=\"gpu:0\"} 800"));
        assert!(output.contains("memforge_pool_used_bytes{device=\"cpu\"} 100"));
        assert!(output.contains("memforge_pool_failed_allocations{device=\"cpu\"} 1"));
    }

    #[test]
    fn test_pressure_gauge() {
        let metrics = MemoryMetrics::new();
        metrics.set_pressure(Device::Gpu(0), MemoryPressure::Critical);
        assert!(metrics
            .export()
            .contains("memforge_memory_pressure{device=\"gpu:0\"} 2"));
    }

    #[test]
    fn test_cache_counters_sync_by_delta() {
        let metrics = MemoryMetrics::new();
        let mut stats = CacheStats {
            hits: 5,
            misses: 2,
            ..Default::default()
        };
        metrics.observe_cache(&stats);
        metrics.observe_cache(&stats);
        stats.hits = 7;
        metrics.observe_cache(&stats);

        let output = metrics.export();
        assert!(output.contains("memforge_cache_hits_total 7"));
        assert!(output.contains("memforge_cache_misses_total 2"));
    }

    #[test]
    fn test_migration_histograms() {
        let metrics = MemoryMetrics::new();
        let report = MigrationReport {
            model: "m".to_string(),
            from: Device::Gpu(0),
            to: Device::Cpu,
            entries: 1,
            bytes: 10,
            elapsed: Duration::from_millis(5),
        };
        metrics.record_migration(MigrationKind::Offload, &report);
        metrics.record_tick_timeout();

        let output = metrics.export();
        assert!(output.contains("memforge_offload_duration_seconds_count 1"));
        assert!(output.contains("memforge_restore_duration_seconds_count 0"));
        assert!(output.contains("memforge_tick_timeouts_total 1"));
    }

    #[test]
    fn test_export_has_help_lines() {
        let output = MemoryMetrics::new().export();
        assert!(output.contains("# HELP memforge_cache_entries"));
        assert!(output.contains("# TYPE memforge_offloads counter"));
    }
}
