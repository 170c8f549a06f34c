//! Offloader state machine and reporting types

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::cache::MigrationReport;
use crate::config::MemoryConfig;
use crate::device::Device;

/// Where a tracked model's weights live
///
/// Legal transitions:
/// Resident -> Offloading -> Offloaded -> Restoring -> Resident, with
/// Offloading falling back to Resident and Restoring to Offloaded on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelState {
    Resident { device: Device },
    Offloading { from: Device, to: Device },
    Offloaded { device: Device },
    Restoring { from: Device, to: Device },
}

impl ModelState {
    /// Device serving reads right now
    ///
    /// Mid-migration the source still holds the authoritative copy.
    pub fn device(&self) -> Device {
        match *self {
            ModelState::Resident { device } | ModelState::Offloaded { device } => device,
            ModelState::Offloading { from, .. } | ModelState::Restoring { from, .. } => from,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelState::Resident { .. } => "resident",
            ModelState::Offloading { .. } => "offloading",
            ModelState::Offloaded { .. } => "offloaded",
            ModelState::Restoring { .. } => "restoring",
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, ModelState::Resident { .. })
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self, ModelState::Offloaded { .. })
    }

    pub fn is_migrating(&self) -> bool {
        matches!(
            self,
            ModelState::Offloading { .. } | ModelState::Restoring { .. }
        )
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::Resident { device } => write!(f, "resident({})", device),
            ModelState::Offloading { from, to } => write!(f, "offloading({} -> {})", from, to),
            ModelState::Offloaded { device } => write!(f, "offloaded({})", device),
            ModelState::Restoring { from, to } => write!(f, "restoring({} -> {})", from, to),
        }
    }
}

/// A model the offloader proposes to move
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffloadDecision {
    pub model: String,
    pub from: Device,
    pub to: Device,
}

/// Result of a restore request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored { report: MigrationReport },
    /// Home pool lacks room; the model stays offloaded
    InsufficientCapacity { required: usize, available: usize },
    /// Requests are reading the offloaded copy; retried on a later tick
    InUse { in_flight: usize },
    AlreadyResident,
}

/// Read-only view of one tracked model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub model: String,
    pub state: ModelState,
    pub home_device: Device,
    pub in_flight: usize,
    pub cached_bytes: usize,
    pub idle: Duration,
    pub offloads: u64,
    pub restores: u64,
    pub consecutive_failures: u32,
    /// Set once retries are exhausted; cleared by a successful migration or
    /// `clear_failure`
    pub persistent_failure: Option<String>,
    pub last_error: Option<String>,
}

/// Offloader policy settings
#[derive(Debug, Clone, PartialEq)]
pub struct OffloaderConfig {
    pub offload_threshold: f64,
    pub restore_threshold: f64,
    pub offload_device: Device,
    pub eligibility_window: Duration,
    pub max_retries: u32,
    pub migration_timeout: Duration,
}

impl Default for OffloaderConfig {
    fn default() -> Self {
        Self::from_memory_config(&MemoryConfig::default())
    }
}

impl OffloaderConfig {
    pub fn from_memory_config(config: &MemoryConfig) -> Self {
        Self {
            offload_threshold: config.offload_threshold,
            restore_threshold: config.restore_threshold,
            offload_device: config.offload_device,
            eligibility_window: config.offload_eligibility_window(),
            max_retries: config.max_migration_retries,
            migration_timeout: config.migration_timeout(),
        }
    }

    pub fn with_eligibility_window(mut self, window: Duration) -> Self {
        self.eligibility_window = window;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_offload_device(mut self, device: Device) -> Self {
        self.offload_device = device;
        self
    }

    pub fn with_thresholds(mut self, offload: f64, restore: f64) -> Self {
        self.offload_threshold = offload;
        self.restore_threshold = restore;
        self
    }

    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = timeout;
        self
    }
}

/// What one policy tick did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub offloaded: Vec<MigrationReport>,
    pub restored: Vec<MigrationReport>,
    /// (model, error) for every failed attempt
    pub failures: Vec<(String, String)>,
    /// Restores put off because the home pool was short on space or the
    /// model was in use
    pub deferred_restores: Vec<String>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.offloaded.is_empty()
            && self.restored.is_empty()
            && self.failures.is_empty()
            && self.deferred_restores.is_empty()
    }
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OffloadCounters {
    pub offloads: u64,
    pub restores: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub persistent_failures: u64,
}
