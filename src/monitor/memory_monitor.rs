//! Memory monitor
//!
//! Samples every registered [`MemoryUsageSource`], keeps a hysteresis-filtered
//! pressure level per device and an append-only, bounded usage history.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use super::pressure::{MemoryPressure, PressureThresholds};
use super::source::{DeviceUsage, MemoryUsageSource};
use crate::clock::{Clock, SystemClock};
use crate::config::MemoryConfig;
use crate::device::Device;
use crate::error::ForgeResult;

/// Usage of one device after merging all sources
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMemoryStats {
    pub device: Device,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub usage_ratio: f64,
    pub fragmentation: Option<f64>,
    /// Source whose observation was kept
    pub source: String,
}

/// Point-in-time snapshot across devices
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    #[serde(skip)]
    pub taken_at: Option<Instant>,
    pub devices: Vec<DeviceMemoryStats>,
}

impl MemoryStats {
    pub fn device(&self, device: Device) -> Option<&DeviceMemoryStats> {
        self.devices.iter().find(|d| d.device == device)
    }

    pub fn total_used(&self) -> u64 {
        self.devices.iter().map(|d| d.used_bytes).sum()
    }

    pub fn total_capacity(&self) -> u64 {
        self.devices.iter().map(|d| d.total_bytes).sum()
    }

    /// Highest usage ratio of any device
    pub fn max_ratio(&self) -> f64 {
        self.devices
            .iter()
            .map(|d| d.usage_ratio)
            .fold(0.0, f64::max)
    }
}

/// One `log_memory_usage` record
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub sequence: u64,
    pub stage: String,
    pub pressure: MemoryPressure,
    pub stats: MemoryStats,
}

/// A pressure level change on one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PressureAlert {
    pub sequence: u64,
    pub device: Device,
    pub from: MemoryPressure,
    pub to: MemoryPressure,
    pub usage_ratio: f64,
}

/// Monitor settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub thresholds: PressureThresholds,
    /// Capacity of the usage history ring buffer
    pub history_size: usize,
    /// Capacity of the alert list
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: PressureThresholds::default(),
            history_size: 128,
            max_alerts: 128,
        }
    }
}

impl MonitorConfig {
    pub fn from_memory_config(config: &MemoryConfig) -> Self {
        Self {
            thresholds: PressureThresholds {
                warning: config.alert_thresholds.warning,
                critical: config.alert_thresholds.critical,
                hysteresis_margin: config.hysteresis_margin,
            },
            history_size: config.history_size,
            max_alerts: config.history_size,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    levels: BTreeMap<Device, MemoryPressure>,
    history: VecDeque<UsageRecord>,
    alerts: VecDeque<PressureAlert>,
    sequence: u64,
}

/// Samples device memory and derives pressure levels
pub struct MemoryMonitor {
    config: MonitorConfig,
    sources: Vec<Arc<dyn MemoryUsageSource>>,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("config", &self.config)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MemoryMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            clock: Arc::new(SystemClock),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Add a usage source
    pub fn with_source(mut self, source: Arc<dyn MemoryUsageSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Synchronous snapshot of every device
    ///
    /// When several sources report the same device, the observation with the
    /// highest usage ratio is kept.
    pub fn get_memory_stats(&self) -> MemoryStats {
        let mut merged: BTreeMap<Device, (DeviceUsage, &str)> = BTreeMap::new();

        for source in &self.sources {
            for usage in source.sample() {
                let replace = match merged.get(&usage.device) {
                    Some((existing, _)) => usage.usage_ratio() > existing.usage_ratio(),
                    None => true,
                };
                if replace {
                    merged.insert(usage.device, (usage, source.name()));
                }
            }
        }

        let devices = merged
            .into_values()
            .map(|(u, source)| DeviceMemoryStats {
                device: u.device,
                used_bytes: u.used_bytes,
                free_bytes: u.total_bytes.saturating_sub(u.used_bytes),
                total_bytes: u.total_bytes,
                usage_ratio: u.usage_ratio(),
                fragmentation: u.fragmentation,
                source: source.to_string(),
            })
            .collect();

        MemoryStats {
            taken_at: Some(self.clock.now()),
            devices,
        }
    }

    /// Sample usage and update the per-device pressure levels
    ///
    /// Returns the highest level across devices.
    pub fn check_memory_pressure(&self) -> ForgeResult<MemoryPressure> {
        let stats = self.get_memory_stats();
        self.update_levels(&stats)
    }

    /// Current level of one device, without sampling
    pub fn pressure_for(&self, device: Device) -> MemoryPressure {
        self.state
            .lock()
            .map(|s| s.levels.get(&device).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Current level of every device, without sampling
    pub fn current_levels(&self) -> BTreeMap<Device, MemoryPressure> {
        self.state
            .lock()
            .map(|s| s.levels.clone())
            .unwrap_or_default()
    }

    /// Fresh usage ratio of one device
    pub fn device_ratio(&self, device: Device) -> Option<f64> {
        self.get_memory_stats()
            .device(device)
            .map(|d| d.usage_ratio)
    }

    /// Record a snapshot tagged with `stage`
    ///
    /// The history is a ring buffer: once full, the oldest record is dropped.
    pub fn log_memory_usage(&self, stage: &str) -> ForgeResult<()> {
        let stats = self.get_memory_stats();
        let pressure = stats
            .devices
            .iter()
            .map(|d| self.pressure_for(d.device))
            .max()
            .unwrap_or_default();

        tracing::debug!(
            stage,
            used_bytes = stats.total_used(),
            total_bytes = stats.total_capacity(),
            pressure = %pressure,
            "memory usage"
        );

        let mut state = self.state.lock()?;
        state.sequence += 1;
        let record = UsageRecord {
            sequence: state.sequence,
            stage: stage.to_string(),
            pressure,
            stats,
        };

        if self.config.history_size == 0 {
            return Ok(());
        }
        while state.history.len() >= self.config.history_size {
            state.history.pop_front();
        }
        state.history.push_back(record);
        Ok(())
    }

    /// Usage history, oldest first
    pub fn history(&self) -> Vec<UsageRecord> {
        self.state
            .lock()
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pressure transitions, oldest first
    pub fn alerts(&self) -> Vec<PressureAlert> {
        self.state
            .lock()
            .map(|s| s.alerts.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn update_levels(&self, stats: &MemoryStats) -> ForgeResult<MemoryPressure> {
        let thresholds = self.config.thresholds;
        let mut state = self.state.lock()?;
        let mut overall = MemoryPressure::Normal;

        for dev in &stats.devices {
            let current = state.levels.get(&dev.device).copied().unwrap_or_default();
            let next = thresholds.next_level(current, dev.usage_ratio);

            if next != current {
                state.sequence += 1;
                let alert = PressureAlert {
                    sequence: state.sequence,
                    device: dev.device,
                    from: current,
                    to: next,
                    usage_ratio: dev.usage_ratio,
                };
                log_transition(&alert);

                while state.alerts.len() >= self.config.max_alerts.max(1) {
                    state.alerts.pop_front();
                }
                state.alerts.push_back(alert);
                state.levels.insert(dev.device, next);
            } else {
                state.levels.entry(dev.device).or_insert(next);
            }

            overall = overall.max(next);
        }

        Ok(overall)
    }
}

fn log_transition(alert: &PressureAlert) {
    match alert.to {
        MemoryPressure::Critical => tracing::error!(
            device = %alert.device,
            from = %alert.from,
            usage_ratio = alert.usage_ratio,
            "memory pressure critical"
        ),
        MemoryPressure::Warning if alert.from < MemoryPressure::Warning => tracing::warn!(
            device = %alert.device,
            usage_ratio = alert.usage_ratio,
            "memory pressure warning"
        ),
        _ => tracing::info!(
            device = %alert.device,
            from = %alert.from,
            to = %alert.to,
            usage_ratio = alert.usage_ratio,
            "memory pressure eased"
        ),
    }
}
