//! Configuration for the memory subsystem
//!
//! [`MemoryConfig`] is read from JSON (every key optional, unknown keys
//! rejected), optionally overridden from the environment, and validated
//! before any component is built.
//!
//! # Environment Variables
//!
//! - `MEMFORGE_CACHE_SIZE_GB`: weight cache size in GiB
//! - `MEMFORGE_MONITORING_INTERVAL`: monitor tick interval in seconds
//! - `MEMFORGE_ENABLE_AUTO_OFFLOAD`: `true`/`false`

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::device::Device;
use crate::error::{ForgeResult, MemForgeError};

const GIB: u64 = 1024 * 1024 * 1024;

/// Upper bounds keeping every duration representable
const MAX_MONITORING_INTERVAL_SECS: f64 = 86_400.0;
const MAX_ELIGIBILITY_SECS: f64 = 30.0 * 86_400.0;
const MAX_TIMEOUT_MS: u64 = 86_400_000;

const CACHE_SIZE_ENV: &str = "MEMFORGE_CACHE_SIZE_GB";
const MONITORING_INTERVAL_ENV: &str = "MEMFORGE_MONITORING_INTERVAL";
const AUTO_OFFLOAD_ENV: &str = "MEMFORGE_ENABLE_AUTO_OFFLOAD";

/// Warning / critical usage fractions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.9,
        }
    }
}

/// Memory subsystem configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Build per-device pools
    pub enable_memory_pools: bool,

    /// Byte capacity per device pool
    pub pool_sizes: BTreeMap<Device, u64>,

    /// Alignment of every pool allocation (power of two)
    pub pool_alignment: usize,

    /// Build the weight cache (requires pools)
    pub enable_weight_cache: bool,

    /// Weight cache budget in GiB
    pub cache_size_gb: f64,

    /// Optional cap on the number of cache entries
    pub cache_max_entries: Option<usize>,

    /// Device new cache entries are allocated on
    pub cache_device: Device,

    /// Compress cached weights; needs a codec to be supplied
    pub cache_compression: bool,

    /// Run the automatic offloader (requires cache and monitoring)
    pub enable_auto_offload: bool,

    /// Offload from a device until its usage ratio drops below this
    pub offload_threshold: f64,

    /// Restore only while the projected usage ratio stays at or below this
    pub restore_threshold: f64,

    /// Device models are offloaded to
    pub offload_device: Device,

    /// Idle time before a model becomes eligible for offload (seconds)
    pub offload_eligibility_secs: f64,

    /// Failed migrations are retried this many times before being reported
    pub max_migration_retries: u32,

    /// Deadline for a single offload or restore (milliseconds)
    pub migration_timeout_ms: u64,

    /// Run the memory monitor
    pub enable_monitoring: bool,

    /// Background tick interval (seconds)
    pub monitoring_interval: f64,

    /// Deadline for one background tick (milliseconds)
    pub tick_timeout_ms: u64,

    /// Pressure level thresholds
    pub alert_thresholds: AlertThresholds,

    /// Downgrade margin applied to the alert thresholds
    pub hysteresis_margin: f64,

    /// Usage history ring buffer size
    pub history_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let mut pool_sizes = BTreeMap::new();
        pool_sizes.insert(Device::Gpu(0), 8 * GIB);
        pool_sizes.insert(Device::Cpu, 32 * GIB);

        MemoryConfig {
            enable_memory_pools: true,
            pool_sizes,
            pool_alignment: 256,
            enable_weight_cache: true,
            cache_size_gb: 4.0,
            cache_max_entries: None,
            cache_device: Device::Gpu(0),
            cache_compression: false,
            enable_auto_offload: true,
            offload_threshold: 0.8,
            restore_threshold: 0.6,
            offload_device: Device::Cpu,
            offload_eligibility_secs: 30.0,
            max_migration_retries: 3,
            migration_timeout_ms: 30_000,
            enable_monitoring: true,
            monitoring_interval: 1.0,
            tick_timeout_ms: 5_000,
            alert_thresholds: AlertThresholds::default(),
            hysteresis_margin: 0.1,
            history_size: 128,
        }
    }
}

impl MemoryConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> ForgeResult<Self> {
        let config: MemoryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ForgeResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MemForgeError::Io(std::io::Error::new(
                e.kind(),
                format!("reading {}: {}", path.display(), e),
            ))
        })?;
        tracing::debug!(path = %path.display(), "loading memory config");
        Self::from_json_str(&contents)
    }

    /// Serialize to pretty JSON
    pub fn to_json_pretty(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply `MEMFORGE_*` overrides, then validate
    pub fn apply_env_overrides(mut self) -> ForgeResult<Self> {
        if let Ok(value) = std::env::var(CACHE_SIZE_ENV) {
            self.cache_size_gb = value
                .trim()
                .parse()
                .map_err(|_| config_error!("{} must be a number, got '{}'", CACHE_SIZE_ENV, value))?;
        }
        if let Ok(value) = std::env::var(MONITORING_INTERVAL_ENV) {
            self.monitoring_interval = value.trim().parse().map_err(|_| {
                config_error!("{} must be a number, got '{}'", MONITORING_INTERVAL_ENV, value)
            })?;
        }
        if let Ok(value) = std::env::var(AUTO_OFFLOAD_ENV) {
            self.enable_auto_offload = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(config_error!(
                        "{} must be a boolean, got '{}'",
                        AUTO_OFFLOAD_ENV,
                        value
                    ))
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Check every constraint between settings
    pub fn validate(&self) -> ForgeResult<()> {
        let in_unit = |name: &str, v: f64| -> ForgeResult<()> {
            if v > 0.0 && v < 1.0 {
                Ok(())
            } else {
                Err(config_error!("{} must be in (0, 1), got {}", name, v))
            }
        };

        in_unit("offload_threshold", self.offload_threshold)?;
        in_unit("restore_threshold", self.restore_threshold)?;
        in_unit("alert_thresholds.warning", self.alert_thresholds.warning)?;
        in_unit("alert_thresholds.critical", self.alert_thresholds.critical)?;

        if self.offload_threshold <= self.restore_threshold {
            return Err(config_error!(
                "offload_threshold ({}) must be greater than restore_threshold ({})",
                self.offload_threshold,
                self.restore_threshold
            ));
        }
        if self.alert_thresholds.warning >= self.alert_thresholds.critical {
            return Err(config_error!(
                "warning threshold ({}) must be below critical threshold ({})",
                self.alert_thresholds.warning,
                self.alert_thresholds.critical
            ));
        }
        if !(self.hysteresis_margin >= 0.0 && self.hysteresis_margin < self.alert_thresholds.warning)
        {
            return Err(config_error!(
                "hysteresis_margin must be in [0, warning), got {}",
                self.hysteresis_margin
            ));
        }
        if !(self.monitoring_interval > 0.0
            && self.monitoring_interval <= MAX_MONITORING_INTERVAL_SECS)
        {
            return Err(config_error!(
                "monitoring_interval must be in (0, {}] seconds, got {}",
                MAX_MONITORING_INTERVAL_SECS,
                self.monitoring_interval
            ));
        }
        for (name, value) in [
            ("tick_timeout_ms", self.tick_timeout_ms),
            ("migration_timeout_ms", self.migration_timeout_ms),
        ] {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(config_error!(
                    "{} must be in [1, {}], got {}",
                    name,
                    MAX_TIMEOUT_MS,
                    value
                ));
            }
        }
        if self.history_size == 0 {
            return Err(config_error!("history_size must be at least 1"));
        }
        if !self.pool_alignment.is_power_of_two() {
            return Err(config_error!(
                "pool_alignment must be a power of 2, got {}",
                self.pool_alignment
            ));
        }
        if !(self.offload_eligibility_secs >= 0.0
            && self.offload_eligibility_secs <= MAX_ELIGIBILITY_SECS)
        {
            return Err(config_error!(
                "offload_eligibility_secs must be in [0, {}], got {}",
                MAX_ELIGIBILITY_SECS,
                self.offload_eligibility_secs
            ));
        }

        if self.enable_memory_pools {
            if self.pool_sizes.is_empty() {
                return Err(config_error!("pool_sizes must name at least one device"));
            }
            if let Some((device, _)) = self.pool_sizes.iter().find(|(_, &size)| size == 0) {
                return Err(config_error!("pool size for {} must be non-zero", device));
            }
        }

        if self.enable_weight_cache {
            if !(self.cache_size_gb.is_finite() && self.cache_size_gb > 0.0) {
                return Err(config_error!(
                    "cache_size_gb must be positive, got {}",
                    self.cache_size_gb
                ));
            }
            if self.cache_max_entries == Some(0) {
                return Err(config_error!("cache_max_entries must be at least 1"));
            }
            if self.enable_memory_pools && !self.pool_sizes.contains_key(&self.cache_device) {
                return Err(config_error!(
                    "cache_device {} has no entry in pool_sizes",
                    self.cache_device
                ));
            }
        }

        if self.enable_auto_offload && self.enable_memory_pools {
            if !self.pool_sizes.contains_key(&self.offload_device) {
                return Err(config_error!(
                    "offload_device {} has no entry in pool_sizes",
                    self.offload_device
                ));
            }
            if self.offload_device == self.cache_device {
                return Err(config_error!(
                    "offload_device must differ from cache_device ({})",
                    self.cache_device
                ));
            }
        }

        Ok(())
    }

    /// Cache budget in bytes
    pub fn cache_capacity_bytes(&self) -> usize {
        (self.cache_size_gb * GIB as f64) as usize
    }

    pub fn monitoring_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.monitoring_interval)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    pub fn offload_eligibility_window(&self) -> Duration {
        Duration::from_secs_f64(self.offload_eligibility_secs)
    }

    /// Set the capacity of one device pool
    pub fn with_pool_size(mut self, device: Device, bytes: u64) -> Self {
        self.pool_sizes.insert(device, bytes);
        self
    }

    /// Replace all pool capacities
    pub fn with_pool_sizes(mut self, pool_sizes: BTreeMap<Device, u64>) -> Self {
        self.pool_sizes = pool_sizes;
        self
    }

    pub fn with_pool_alignment(mut self, alignment: usize) -> Self {
        self.pool_alignment = alignment;
        self
    }

    pub fn with_cache_size_gb(mut self, cache_size_gb: f64) -> Self {
        self.cache_size_gb = cache_size_gb;
        self
    }

    pub fn with_cache_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.cache_max_entries = max_entries;
        self
    }

    pub fn with_cache_device(mut self, device: Device) -> Self {
        self.cache_device = device;
        self
    }

    pub fn with_offload_device(mut self, device: Device) -> Self {
        self.offload_device = device;
        self
    }

    pub fn with_auto_offload(mut self, enabled: bool) -> Self {
        self.enable_auto_offload = enabled;
        self
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.enable_monitoring = enabled;
        self
    }

    pub fn with_weight_cache(mut self, enabled: bool) -> Self {
        self.enable_weight_cache = enabled;
        self
    }

    pub fn with_memory_pools(mut self, enabled: bool) -> Self {
        self.enable_memory_pools = enabled;
        self
    }

    pub fn with_thresholds(mut self, offload: f64, restore: f64) -> Self {
        self.offload_threshold = offload;
        self.restore_threshold = restore;
        self
    }

    pub fn with_alert_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.alert_thresholds = AlertThresholds { warning, critical };
        self
    }

    pub fn with_hysteresis_margin(mut self, margin: f64) -> Self {
        self.hysteresis_margin = margin;
        self
    }

    pub fn with_monitoring_interval(mut self, seconds: f64) -> Self {
        self.monitoring_interval = seconds;
        self
    }

    pub fn with_offload_eligibility_secs(mut self, seconds: f64) -> Self {
        self.offload_eligibility_secs = seconds;
        self
    }

    pub fn with_max_migration_retries(mut self, retries: u32) -> Self {
        self.max_migration_retries = retries;
        self
    }

    pub fn with_migration_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.migration_timeout_ms = timeout_ms;
        self
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }

    pub fn with_cache_compression(mut self, enabled: bool) -> Self {
        self.cache_compression = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MemoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alert_thresholds.warning, 0.75);
        assert_eq!(config.alert_thresholds.critical, 0.9);
        assert_eq!(config.monitoring_interval_duration(), Duration::from_secs(1));
        assert_eq!(config.cache_capacity_bytes(), 4 * GIB as usize);
    }

    #[test]
    fn test_offload_must_exceed_restore() {
        let config = MemoryConfig::new().with_thresholds(0.5, 0.6);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("offload_threshold"));
    }

    #[test]
    fn test_warning_must_be_below_critical() {
        let config = MemoryConfig::new().with_alert_thresholds(0.9, 0.8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thresholds_must_be_fractions() {
        assert!(MemoryConfig::new().with_thresholds(1.0, 0.5).validate().is_err());
        assert!(MemoryConfig::new().with_thresholds(0.8, 0.0).validate().is_err());
    }

    #[test]
    fn test_durations_are_bounded() {
        for interval in [0.0, -1.0, 1e20, f64::NAN, f64::INFINITY] {
            let config = MemoryConfig::new().with_monitoring_interval(interval);
            assert!(config.validate().is_err(), "interval {}", interval);
        }
        for secs in [-0.5, 1e20, f64::NAN] {
            let config = MemoryConfig::new().with_offload_eligibility_secs(secs);
            assert!(config.validate().is_err(), "eligibility {}", secs);
        }
        for ms in [0, u64::MAX] {
            let config = MemoryConfig::new().with_migration_timeout_ms(ms);
            assert!(config.validate().is_err(), "migration timeout {}", ms);
            let config = MemoryConfig {
                tick_timeout_ms: ms,
                ..MemoryConfig::default()
            };
            assert!(config.validate().is_err(), "tick timeout {}", ms);
        }

        let config = MemoryConfig::new()
            .with_monitoring_interval(MAX_MONITORING_INTERVAL_SECS)
            .with_offload_eligibility_secs(MAX_ELIGIBILITY_SECS)
            .with_migration_timeout_ms(MAX_TIMEOUT_MS);
        config.validate().unwrap();
        assert_eq!(config.monitoring_interval_duration(), Duration::from_secs(86_400));
        assert_eq!(config.migration_timeout(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_cache_device_needs_pool() {
        let config = MemoryConfig::new().with_cache_device(Device::Gpu(3));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_offload_device_must_differ_from_cache_device() {
        let config = MemoryConfig::new().with_offload_device(Device::Gpu(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let config = MemoryConfig::new().with_pool_size(Device::Cpu, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "pool_sizes": {"gpu:0": 1048576, "cpu": 4194304},
            "cache_size_gb": 0.0005,
            "alert_thresholds": {"warning": 0.7, "critical": 0.85}
        }"#;
        let config = MemoryConfig::from_json_str(json).unwrap();
        assert_eq!(config.pool_sizes[&Device::Gpu(0)], 1_048_576);
        assert_eq!(config.alert_thresholds.warning, 0.7);
        assert!(config.enable_auto_offload);
        assert_eq!(config.offload_device, Device::Cpu);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = MemoryConfig::from_json_str(r#"{"enable_turbo": true}"#).unwrap_err();
        assert!(matches!(err, MemForgeError::Config(_)));
    }

    #[test]
    fn test_json_roundtrip_preserves_values() {
        let config = MemoryConfig::new()
            .with_cache_max_entries(Some(16))
            .with_monitoring_interval(0.5);
        let json = config.to_json_pretty().unwrap();
        let back = MemoryConfig::from_json_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
