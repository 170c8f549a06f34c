//! Facade wiring pools, cache, monitor and offloader together
//!
//! Components are built from [`MemoryConfig`] according to their enable
//! flags. The background task calls [`MemoryManager::tick`] every
//! `monitoring_interval`; request-path calls go straight to the components
//! and never wait on a tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{CacheConfig, CacheStats, ModelWeightCache, WeightCodec};
use crate::clock::{Clock, SystemClock};
use crate::config::MemoryConfig;
use crate::device::Device;
use crate::error::{ForgeResult, MemForgeError};
use crate::memory::{MemoryBlock, MemoryPoolManager, PoolStats};
use crate::metrics::{MemoryMetrics, MigrationKind};
use crate::monitor::{
    MemoryMonitor, MemoryPressure, MemoryStats, MemoryUsageSource, MonitorConfig, PressureAlert,
};
use crate::offload::{
    AutomaticOffloader, InferenceLease, ModelStatus, OffloaderConfig, TickReport,
};

/// What one maintenance tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub sequence: u64,
    /// Previous tick was still running; nothing was done
    pub skipped: bool,
    pub pressure: MemoryPressure,
    pub coalesced: usize,
    pub evicted_bytes: usize,
    pub offload: Option<TickReport>,
}

/// Serializable snapshot of the whole subsystem
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub pressure: BTreeMap<Device, MemoryPressure>,
    pub memory: Option<MemoryStats>,
    pub pools: Vec<PoolStats>,
    pub cache: Option<CacheStats>,
    pub models: Vec<ModelStatus>,
    pub recent_alerts: Vec<PressureAlert>,
}

/// Builder for [`MemoryManager`] with injectable collaborators
pub struct MemoryManagerBuilder {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    sources: Vec<Arc<dyn MemoryUsageSource>>,
    codec: Option<Arc<dyn WeightCodec>>,
}

impl MemoryManagerBuilder {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            sources: Vec::new(),
            codec: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Extra usage source for the monitor, e.g. a device driver backend
    pub fn with_usage_source(mut self, source: Arc<dyn MemoryUsageSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn WeightCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> ForgeResult<MemoryManager> {
        let config = self.config;
        config.validate()?;

        let pools = if config.enable_memory_pools {
            Some(Arc::new(MemoryPoolManager::from_config(&config)?))
        } else {
            None
        };

        let cache = match (&pools, config.enable_weight_cache) {
            (Some(pools), true) => {
                let mut cache_config = CacheConfig::from_memory_config(&config);
                if self.codec.is_some() {
                    // A codec is present, so no uncompressed fallback warning
                    cache_config.compression = false;
                }
                let mut cache = ModelWeightCache::new(cache_config, Arc::clone(pools))?
                    .with_clock(Arc::clone(&self.clock));
                if let Some(codec) = self.codec {
                    cache = cache.with_codec(codec);
                }
                Some(Arc::new(cache))
            }
            (None, true) => {
                tracing::warn!("weight cache requires memory pools; cache disabled");
                None
            }
            (_, false) => None,
        };

        let monitor = if config.enable_monitoring {
            let mut monitor = MemoryMonitor::new(MonitorConfig::from_memory_config(&config))
                .with_clock(Arc::clone(&self.clock));
            if let Some(pools) = &pools {
                monitor = monitor.with_source(Arc::clone(pools) as Arc<dyn MemoryUsageSource>);
            }
            for source in self.sources {
                monitor = monitor.with_source(source);
            }
            Some(Arc::new(monitor))
        } else {
            None
        };

        let offloader = match (&cache, &monitor, config.enable_auto_offload) {
            (Some(cache), Some(monitor), true) => Some(Arc::new(
                AutomaticOffloader::new(
                    OffloaderConfig::from_memory_config(&config),
                    Arc::clone(cache),
                    Arc::clone(monitor),
                )
                .with_clock(Arc::clone(&self.clock)),
            )),
            (_, _, true) => {
                tracing::warn!(
                    cache = cache.is_some(),
                    monitoring = monitor.is_some(),
                    "automatic offload requires the weight cache and monitoring; offload disabled"
                );
                None
            }
            _ => None,
        };

        tracing::info!(
            pools = pools.is_some(),
            cache = cache.is_some(),
            monitoring = monitor.is_some(),
            offload = offloader.is_some(),
            "MemoryManager initialized"
        );

        Ok(MemoryManager {
            config,
            pools,
            cache,
            monitor,
            offloader,
            metrics: Arc::new(MemoryMetrics::new()),
            tick_guard: Mutex::new(0),
        })
    }
}

/// Entry point for the serving pipeline
///
/// # Example
///
/// ```rust,ignore
/// let manager = Arc::new(MemoryManager::from_config(MemoryConfig::from_json_file("memory.json")?)?);
/// let background = Arc::clone(&manager).start_background();
///
/// let weights = manager.load_weights("llama-7b", "layers.0.attn", || read_layer())?;
///
/// background.stop().await;
/// ```
pub struct MemoryManager {
    config: MemoryConfig,
    pools: Option<Arc<MemoryPoolManager>>,
    cache: Option<Arc<ModelWeightCache>>,
    monitor: Option<Arc<MemoryMonitor>>,
    offloader: Option<Arc<AutomaticOffloader>>,
    metrics: Arc<MemoryMetrics>,
    /// Tick sequence; held for the duration of a tick
    tick_guard: Mutex<u64>,
}

impl MemoryManager {
    pub fn from_config(config: MemoryConfig) -> ForgeResult<Self> {
        MemoryManagerBuilder::new(config).build()
    }

    pub fn builder(config: MemoryConfig) -> MemoryManagerBuilder {
        MemoryManagerBuilder::new(config)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn pools(&self) -> Option<&Arc<MemoryPoolManager>> {
        self.pools.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<ModelWeightCache>> {
        self.cache.as_ref()
    }

    pub fn monitor(&self) -> Option<&Arc<MemoryMonitor>> {
        self.monitor.as_ref()
    }

    pub fn offloader(&self) -> Option<&Arc<AutomaticOffloader>> {
        self.offloader.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MemoryMetrics> {
        &self.metrics
    }

    /// Allocate from a device pool
    ///
    /// On `OutOfMemory` the cache is asked to give up `size` bytes on the
    /// same device and the allocation is tried once more.
    pub fn allocate(&self, size: usize, device: Device) -> ForgeResult<MemoryBlock> {
        let pools = self.require_pools()?;
        match pools.allocate(size, device) {
            Err(MemForgeError::OutOfMemory { .. }) if self.cache.is_some() => {
                if let Some(cache) = &self.cache {
                    let outcome = cache.evict_from_device(device, size)?;
                    tracing::debug!(
                        device = %device,
                        size,
                        freed = outcome.freed_bytes,
                        "evicted cache entries to satisfy allocation"
                    );
                }
                pools.allocate(size, device)
            }
            other => other,
        }
    }

    pub fn deallocate(&self, block: MemoryBlock) -> ForgeResult<()> {
        self.require_pools()?.deallocate(block)
    }

    /// Start tracking a model whose weights belong on `home`
    pub fn register_model(&self, model: &str, home: Device) -> ForgeResult<()> {
        match (&self.offloader, &self.cache) {
            (Some(offloader), _) => offloader.register_model(model, home),
            (None, Some(cache)) => cache.set_model_device(model, home),
            (None, None) => Ok(()),
        }
    }

    /// Weights for one layer, from the cache or from `loader`
    ///
    /// A miss calls `loader` and caches the result. Payloads too large for
    /// the cache are returned uncached.
    pub fn load_weights<F>(&self, model: &str, layer: &str, loader: F) -> ForgeResult<Vec<u8>>
    where
        F: FnOnce() -> ForgeResult<Vec<u8>>,
    {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return loader(),
        };

        if let Some(weights) = cache.get(model, layer)? {
            return Ok(weights);
        }

        let weights = loader()?;
        match cache.put(model, layer, &weights) {
            Ok(()) => {}
            Err(MemForgeError::CacheEntryTooLarge { size, capacity }) => {
                tracing::debug!(model, layer, size, capacity, "layer too large to cache; serving uncached");
            }
            Err(e) => return Err(e),
        }
        Ok(weights)
    }

    /// Pin a model for the duration of a request
    ///
    /// Returns `None` when automatic offload is disabled.
    pub fn begin_inference(&self, model: &str) -> ForgeResult<Option<InferenceLease>> {
        match &self.offloader {
            Some(offloader) => offloader.begin_inference(model).map(Some),
            None => Ok(None),
        }
    }

    /// One maintenance pass
    ///
    /// Samples pressure, records usage history, coalesces pools under
    /// pressure, evicts cache entries from critical devices and runs the
    /// offload policy. Overlapping calls are skipped rather than queued.
    pub fn tick(&self) -> ForgeResult<TickSummary> {
        let mut sequence = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("previous tick still running; skipping");
                return Ok(TickSummary {
                    skipped: true,
                    ..TickSummary::default()
                });
            }
            Err(TryLockError::Poisoned(e)) => return Err(MemForgeError::from(e)),
        };
        *sequence += 1;
        let started = Instant::now();
        let mut summary = TickSummary {
            sequence: *sequence,
            ..TickSummary::default()
        };

        if let Some(monitor) = &self.monitor {
            summary.pressure = monitor.check_memory_pressure()?;
            monitor.log_memory_usage("tick")?;
        }

        if let Some(pools) = &self.pools {
            summary.coalesced = pools.cleanup(summary.pressure)?;
        }

        if summary.pressure == MemoryPressure::Critical {
            summary.evicted_bytes = self.relieve_critical_devices()?;
        }

        if let Some(offloader) = &self.offloader {
            let report = offloader.tick();
            for migration in &report.offloaded {
                self.metrics.record_migration(MigrationKind::Offload, migration);
            }
            for migration in &report.restored {
                self.metrics.record_migration(MigrationKind::Restore, migration);
            }
            summary.offload = Some(report);
        }

        self.refresh_metrics();
        self.metrics.record_tick(started.elapsed().as_secs_f64());

        tracing::trace!(
            sequence = summary.sequence,
            pressure = %summary.pressure,
            coalesced = summary.coalesced,
            evicted_bytes = summary.evicted_bytes,
            "maintenance tick"
        );
        Ok(summary)
    }

    /// Evict cache entries from critical devices until they would drop below
    /// the warning threshold
    fn relieve_critical_devices(&self) -> ForgeResult<usize> {
        let (cache, monitor) = match (&self.cache, &self.monitor) {
            (Some(cache), Some(monitor)) => (cache, monitor),
            _ => return Ok(0),
        };

        let warning = self.config.alert_thresholds.warning;
        let mut freed = 0;
        for device in monitor.get_memory_stats().devices {
            if monitor.pressure_for(device.device) != MemoryPressure::Critical {
                continue;
            }
            let target_used = (warning * device.total_bytes as f64) as u64;
            let excess = device.used_bytes.saturating_sub(target_used) as usize;
            if excess == 0 {
                continue;
            }
            let outcome = cache.evict_from_device(device.device, excess)?;
            freed += outcome.freed_bytes;
            if !outcome.satisfied {
                tracing::warn!(
                    device = %device.device,
                    excess,
                    freed = outcome.freed_bytes,
                    "critical pressure persists after cache eviction"
                );
            }
        }
        Ok(freed)
    }

    /// Push current component state into the metrics registry
    pub fn refresh_metrics(&self) {
        if let Some(pools) = &self.pools {
            for stats in pools.all_stats() {
                self.metrics.observe_pool(&stats);
            }
        }
        if let Some(monitor) = &self.monitor {
            for (device, level) in monitor.current_levels() {
                self.metrics.set_pressure(device, level);
            }
        }
        if let Some(cache) = &self.cache {
            match cache.stats() {
                Ok(stats) => self.metrics.observe_cache(&stats),
                Err(e) => tracing::error!(error = %e, "could not read cache stats"),
            }
        }
        if let Some(offloader) = &self.offloader {
            self.metrics.observe_offloader(&offloader.counters());
        }
    }

    /// Prometheus text exposition of current state
    pub fn export_metrics(&self) -> String {
        self.refresh_metrics();
        self.metrics.export()
    }

    /// Snapshot of every enabled component
    pub fn report(&self) -> MemoryReport {
        const RECENT_ALERTS: usize = 16;

        let (pressure, memory, recent_alerts) = match &self.monitor {
            Some(monitor) => {
                let alerts = monitor.alerts();
                let skip = alerts.len().saturating_sub(RECENT_ALERTS);
                (
                    monitor.current_levels(),
                    Some(monitor.get_memory_stats()),
                    alerts.into_iter().skip(skip).collect(),
                )
            }
            None => (BTreeMap::new(), None, Vec::new()),
        };

        MemoryReport {
            pressure,
            memory,
            pools: self
                .pools
                .as_ref()
                .map(|p| p.all_stats())
                .unwrap_or_default(),
            cache: self.cache.as_ref().and_then(|c| c.stats().ok()),
            models: self
                .offloader
                .as_ref()
                .map(|o| o.statuses())
                .unwrap_or_default(),
            recent_alerts,
        }
    }

    /// Run [`tick`](Self::tick) every `monitoring_interval` on the tokio
    /// runtime
    ///
    /// Each tick runs on the blocking pool and is abandoned (logged and
    /// counted) if it exceeds `tick_timeout`. Tick errors never stop the
    /// loop.
    pub fn start_background(self: Arc<Self>) -> BackgroundHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.config.monitoring_interval_duration();
        let tick_timeout = self.config.tick_timeout();

        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            tick_timeout_ms = tick_timeout.as_millis() as u64,
            "starting memory maintenance loop"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }

                let worker = Arc::clone(&self);
                let tick = tokio::task::spawn_blocking(move || worker.tick());
                match tokio::time::timeout(tick_timeout, tick).await {
                    Ok(Ok(Ok(_))) => {}
                    Ok(Ok(Err(e))) => {
                        tracing::error!(error = %e, "maintenance tick failed");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "maintenance tick panicked");
                    }
                    Err(_) => {
                        self.metrics.record_tick_timeout();
                        tracing::warn!(
                            timeout_ms = tick_timeout.as_millis() as u64,
                            "maintenance tick exceeded its deadline"
                        );
                    }
                }
            }

            tracing::info!("memory maintenance loop stopped");
        });

        BackgroundHandle {
            stop: stop_tx,
            task: Some(task),
        }
    }

    fn require_pools(&self) -> ForgeResult<&Arc<MemoryPoolManager>> {
        self.pools.as_ref().ok_or_else(|| {
            MemForgeError::InvalidConfiguration("memory pools are disabled".to_string())
        })
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("pools", &self.pools.is_some())
            .field("cache", &self.cache.is_some())
            .field("monitor", &self.monitor.is_some())
            .field("offloader", &self.offloader.is_some())
            .finish()
    }
}

/// Stops the background loop when stopped or dropped
#[derive(Debug)]
pub struct BackgroundHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Signal the loop and wait for it to exit
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "maintenance loop ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
