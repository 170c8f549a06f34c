//! Weight cache data types

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::MemoryConfig;
use crate::device::Device;
use crate::memory::MemoryBlock;

/// Cache key: one layer of one model
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub model: String,
    pub layer: String,
}

impl CacheKey {
    pub fn new(model: impl Into<String>, layer: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            layer: layer.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.layer)
    }
}

/// A cached layer and the pool block backing it
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub key: CacheKey,
    pub block: MemoryBlock,
    /// Stored (encoded) size charged against the budget
    pub size: usize,
    pub pins: usize,
    pub migrating: bool,
    pub last_access: Instant,
}

/// Cache budget and placement
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub capacity_bytes: usize,
    pub max_entries: Option<usize>,
    /// Home device for models that have no placement yet
    pub default_device: Device,
    pub compression: bool,
}

impl CacheConfig {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            max_entries: None,
            default_device: Device::Gpu(0),
            compression: false,
        }
    }

    pub fn from_memory_config(config: &MemoryConfig) -> Self {
        Self {
            capacity_bytes: config.cache_capacity_bytes(),
            max_entries: config.cache_max_entries,
            default_device: config.cache_device,
            compression: config.cache_compression,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.default_device = device;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }
}

/// Result of an eviction request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionOutcome {
    pub freed_bytes: usize,
    pub evicted: Vec<CacheKey>,
    /// False when pinned or migrating entries kept the target out of reach
    pub satisfied: bool,
}

/// Counters and occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub max_entries: Option<usize>,
    pub pinned_entries: usize,
    pub models: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.capacity_bytes as f64
        }
    }
}

/// Abort conditions checked between entries during a migration
#[derive(Default)]
pub struct MigrationControl<'a> {
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancel: Option<&'a (dyn Fn() -> bool + Sync)>,
}

impl<'a> MigrationControl<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `MigrationTimeout` once the cache clock passes `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fail with `OffloadCancelled` as soon as `cancel` returns true
    pub fn with_cancel(mut self, cancel: &'a (dyn Fn() -> bool + Sync)) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.map(|f| f()).unwrap_or(false)
    }
}

impl fmt::Debug for MigrationControl<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationControl")
            .field("deadline", &self.deadline)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Summary of a completed migration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub model: String,
    pub from: Device,
    pub to: Device,
    pub entries: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}
