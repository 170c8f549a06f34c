//! Pressure-driven offload policy
//!
//! Each tracked model has its own mutex that is held for the whole of a
//! migration, so a request arriving mid-migration blocks until the model's
//! location is settled. The in-flight counter lives outside that mutex: a
//! request bumps it first, which the running offload observes through its
//! cancel check and aborts.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::Instant;

use super::state::{
    ModelState, ModelStatus, OffloadCounters, OffloadDecision, OffloaderConfig, RestoreOutcome,
    TickReport,
};
use crate::cache::{MigrationControl, MigrationReport, ModelWeightCache};
use crate::clock::{Clock, SystemClock};
use crate::device::Device;
use crate::error::{ForgeResult, MemForgeError};
use crate::monitor::{MemoryMonitor, MemoryPressure};

#[derive(Debug)]
struct ModelRecord {
    state: ModelState,
    home: Device,
    offloads: u64,
    restores: u64,
    consecutive_failures: u32,
    persistent_failure: Option<String>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct ModelSlot {
    record: Mutex<ModelRecord>,
    in_flight: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl ModelSlot {
    fn last_used(&self) -> Option<Instant> {
        self.last_used.lock().ok().map(|t| *t)
    }

    fn touch(&self, now: Instant) {
        if let Ok(mut t) = self.last_used.lock() {
            *t = now;
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    offloads: AtomicU64,
    restores: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    persistent_failures: AtomicU64,
}

/// Handle for one in-flight inference request
///
/// Keeps the model pinned in the cache. Dropping it unpins the model and
/// starts its idle window.
#[derive(Debug)]
pub struct InferenceLease {
    model: String,
    device: Device,
    slot: Arc<ModelSlot>,
    cache: Arc<ModelWeightCache>,
    clock: Arc<dyn Clock>,
}

impl InferenceLease {
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Device the request should read weights from
    pub fn device(&self) -> Device {
        self.device
    }
}

impl Drop for InferenceLease {
    fn drop(&mut self) {
        if let Err(e) = self.cache.unpin_model(&self.model) {
            tracing::error!(model = %self.model, error = %e, "failed to unpin model");
        }
        self.slot.touch(self.clock.now());
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Moves idle models off pressured devices and back again
///
/// # Example
///
/// ```rust,ignore
/// let offloader = AutomaticOffloader::new(config, cache, monitor);
/// offloader.register_model("llama-7b", Device::Gpu(0))?;
///
/// {
///     let lease = offloader.begin_inference("llama-7b")?;
///     run(lease.device());
/// }
///
/// let report = offloader.tick();
/// ```
pub struct AutomaticOffloader {
    config: OffloaderConfig,
    cache: Arc<ModelWeightCache>,
    monitor: Arc<MemoryMonitor>,
    clock: Arc<dyn Clock>,
    models: RwLock<HashMap<String, Arc<ModelSlot>>>,
    counters: Counters,
}

impl AutomaticOffloader {
    pub fn new(
        config: OffloaderConfig,
        cache: Arc<ModelWeightCache>,
        monitor: Arc<MemoryMonitor>,
    ) -> Self {
        tracing::info!(
            offload_device = %config.offload_device,
            offload_threshold = config.offload_threshold,
            restore_threshold = config.restore_threshold,
            eligibility_secs = config.eligibility_window.as_secs_f64(),
            "AutomaticOffloader created"
        );
        Self {
            config,
            cache,
            monitor,
            clock: Arc::new(SystemClock),
            models: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &OffloaderConfig {
        &self.config
    }

    /// Start tracking a model whose home is `home`
    ///
    /// If the cache already places the model elsewhere it is tracked as
    /// offloaded. Registering twice is a no-op.
    pub fn register_model(&self, model: &str, home: Device) -> ForgeResult<()> {
        let mut models = self.models.write()?;
        if models.contains_key(model) {
            return Ok(());
        }

        let current = match self.cache.model_device(model) {
            Some(device) => device,
            None => {
                self.cache.set_model_device(model, home)?;
                home
            }
        };
        let state = if current == home {
            ModelState::Resident { device: home }
        } else {
            ModelState::Offloaded { device: current }
        };

        models.insert(
            model.to_string(),
            Arc::new(ModelSlot {
                record: Mutex::new(ModelRecord {
                    state,
                    home,
                    offloads: 0,
                    restores: 0,
                    consecutive_failures: 0,
                    persistent_failure: None,
                    last_error: None,
                }),
                in_flight: AtomicUsize::new(0),
                last_used: Mutex::new(self.clock.now()),
            }),
        );

        tracing::debug!(model, home = %home, state = %state, "model registered");
        Ok(())
    }

    /// Stop tracking a model; cached weights stay where they are
    pub fn unregister_model(&self, model: &str) -> ForgeResult<bool> {
        Ok(self.models.write()?.remove(model).is_some())
    }

    /// Mark a request as in flight and pin the model
    ///
    /// Cancels a running offload and blocks until any migration holding the
    /// model has finished, so the returned device is never a torn location.
    pub fn begin_inference(&self, model: &str) -> ForgeResult<InferenceLease> {
        let slot = self.slot(model)?;
        slot.in_flight.fetch_add(1, Ordering::SeqCst);

        // Pin while holding the model lock so no migration starts in between
        let pinned = match slot.record.lock() {
            Ok(record) => self.cache.pin_model(model).map(|_| record.state.device()),
            Err(e) => Err(MemForgeError::from(e)),
        };

        match pinned {
            Ok(device) => {
                slot.touch(self.clock.now());
                Ok(InferenceLease {
                    model: model.to_string(),
                    device,
                    slot,
                    cache: Arc::clone(&self.cache),
                    clock: Arc::clone(&self.clock),
                })
            }
            Err(e) => {
                slot.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Whether a model is currently a good offload candidate
    ///
    /// Advisory only: never true for models in use, pinned, mid-migration,
    /// already off their home device, or with exhausted retries.
    pub fn should_offload(&self, model: &str) -> bool {
        let slot = match self.slot(model) {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        if slot.in_flight.load(Ordering::SeqCst) > 0 {
            return false;
        }

        let device = {
            let record = match slot.record.try_lock() {
                Ok(record) => record,
                Err(TryLockError::WouldBlock) => return false,
                Err(TryLockError::Poisoned(_)) => return false,
            };
            if record.persistent_failure.is_some() {
                return false;
            }
            match record.state {
                ModelState::Resident { device } => device,
                _ => return false,
            }
        };

        if device == self.config.offload_device {
            return false;
        }
        if self.monitor.pressure_for(device) < MemoryPressure::Warning {
            return false;
        }

        let idle = slot
            .last_used()
            .map(|t| self.clock.now().saturating_duration_since(t))
            .unwrap_or_default();
        if idle <= self.config.eligibility_window {
            return false;
        }

        !self.cache.is_model_pinned(model).unwrap_or(true) && self.cache.model_bytes(model) > 0
    }

    /// Models that would be offloaded right now, least recently used first
    pub fn plan_offloads(&self) -> Vec<OffloadDecision> {
        let mut candidates: Vec<(Instant, OffloadDecision)> = self
            .slots()
            .into_iter()
            .filter(|(model, _)| self.should_offload(model))
            .filter_map(|(model, slot)| {
                let from = slot.record.lock().ok()?.state.device();
                Some((
                    slot.last_used()?,
                    OffloadDecision {
                        model,
                        from,
                        to: self.config.offload_device,
                    },
                ))
            })
            .collect();
        candidates.sort_by_key(|(t, _)| *t);
        candidates.into_iter().map(|(_, d)| d).collect()
    }

    /// Move a resident model to `target`
    ///
    /// The source blocks are released only after the copy is verified and
    /// committed. On any failure the model stays resident.
    ///
    /// # Errors
    /// - `OffloadCancelled` if a request arrived before or during the move
    /// - `OffloadFailure` / `MigrationTimeout` if the move did not complete
    /// - `InvalidStateTransition` if the model is not resident
    pub fn offload_model(&self, model: &str, target: Device) -> ForgeResult<MigrationReport> {
        let slot = self.slot(model)?;
        let mut record = slot.record.lock()?;

        let from = match record.state {
            ModelState::Resident { device } if device != target => device,
            other => {
                return Err(MemForgeError::InvalidStateTransition {
                    model: model.to_string(),
                    from: other.to_string(),
                    to: format!("offloading to {}", target),
                })
            }
        };
        if slot.in_flight.load(Ordering::SeqCst) > 0 {
            self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
            return Err(MemForgeError::OffloadCancelled(model.to_string()));
        }

        record.state = ModelState::Offloading { from, to: target };
        tracing::debug!(model, from = %from, to = %target, "offloading model");

        let cancel = || slot.in_flight.load(Ordering::SeqCst) > 0;
        let control = self.migration_control().with_cancel(&cancel);

        match self.cache.migrate_model(model, target, &control) {
            Ok(report) => {
                record.state = ModelState::Offloaded { device: target };
                record.offloads += 1;
                Self::clear_failures(&mut record);
                self.counters.offloads.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    model,
                    from = %from,
                    to = %target,
                    bytes = report.bytes,
                    "model offloaded"
                );
                Ok(report)
            }
            Err(e) => {
                record.state = ModelState::Resident { device: from };
                if matches!(e, MemForgeError::OffloadCancelled(_)) {
                    self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(model, "offload cancelled by incoming request");
                    return Err(e);
                }
                self.note_failure(model, &mut record, &e);
                Err(Self::as_migration_failure(model, e))
            }
        }
    }

    /// Bring an offloaded model back to its home device
    ///
    /// Leaves the model offloaded, and says so, when the home pool lacks the
    /// free space.
    pub fn restore_model(&self, model: &str) -> ForgeResult<RestoreOutcome> {
        let slot = self.slot(model)?;
        let mut record = slot.record.lock()?;

        let from = match record.state {
            ModelState::Offloaded { device } => device,
            ModelState::Resident { .. } => return Ok(RestoreOutcome::AlreadyResident),
            other => {
                return Err(MemForgeError::InvalidStateTransition {
                    model: model.to_string(),
                    from: other.to_string(),
                    to: "restoring".to_string(),
                })
            }
        };
        let home = record.home;

        let in_flight = slot.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            tracing::debug!(model, in_flight, "model in use; restore deferred");
            return Ok(RestoreOutcome::InUse { in_flight });
        }

        let required = self.cache.model_bytes(model);
        let available = self.cache.pools().get_pool_stats(home)?.free_bytes;
        if required > available {
            tracing::warn!(
                model,
                home = %home,
                required,
                available,
                "not enough room to restore model; staying offloaded"
            );
            return Ok(RestoreOutcome::InsufficientCapacity {
                required,
                available,
            });
        }

        record.state = ModelState::Restoring { from, to: home };
        tracing::debug!(model, from = %from, to = %home, "restoring model");

        let control = self.migration_control();

        match self.cache.migrate_model(model, home, &control) {
            Ok(report) => {
                record.state = ModelState::Resident { device: home };
                record.restores += 1;
                Self::clear_failures(&mut record);
                self.counters.restores.fetch_add(1, Ordering::Relaxed);
                tracing::info!(model, to = %home, bytes = report.bytes, "model restored");
                Ok(RestoreOutcome::Restored { report })
            }
            Err(e) => {
                record.state = ModelState::Offloaded { device: from };
                self.note_failure(model, &mut record, &e);
                Err(Self::as_migration_failure(model, e))
            }
        }
    }

    /// Deadline `migration_timeout` from now; none if that is past the
    /// representable range
    fn migration_control<'a>(&self) -> MigrationControl<'a> {
        match self.clock.now().checked_add(self.config.migration_timeout) {
            Some(deadline) => MigrationControl::new().with_deadline(deadline),
            None => MigrationControl::new(),
        }
    }

    /// One pass of the offload/restore policy
    ///
    /// Refreshes the monitor, offloads eligible models (least recently used
    /// first) from pressured devices until each drops below the offload
    /// threshold, then restores offloaded models whose home device is calm.
    /// Errors are recorded in the report and never propagated.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        if let Err(e) = self.monitor.check_memory_pressure() {
            tracing::error!(error = %e, "offloader could not sample memory pressure");
            return report;
        }

        let stats = self.monitor.get_memory_stats();
        let mut used: BTreeMap<Device, (u64, u64)> = stats
            .devices
            .iter()
            .map(|d| (d.device, (d.used_bytes, d.total_bytes)))
            .collect();
        let ratio = |used: u64, total: u64| {
            if total == 0 {
                0.0
            } else {
                used as f64 / total as f64
            }
        };

        for decision in self.plan_offloads() {
            let (dev_used, dev_total) = match used.get(&decision.from) {
                Some(&entry) => entry,
                None => continue,
            };
            if ratio(dev_used, dev_total) < self.config.offload_threshold {
                continue;
            }

            match self.offload_model(&decision.model, decision.to) {
                Ok(migration) => {
                    let moved = migration.bytes as u64;
                    if let Some(entry) = used.get_mut(&decision.from) {
                        entry.0 = entry.0.saturating_sub(moved);
                    }
                    if let Some(entry) = used.get_mut(&decision.to) {
                        entry.0 += moved;
                    }
                    report.offloaded.push(migration);
                }
                Err(MemForgeError::OffloadCancelled(_)) => {}
                Err(e) => report.failures.push((decision.model.clone(), e.to_string())),
            }
        }

        let mut offloaded: Vec<(Instant, String)> = self
            .slots()
            .into_iter()
            .filter_map(|(model, slot)| {
                let record = slot.record.lock().ok()?;
                if !record.state.is_offloaded() || record.persistent_failure.is_some() {
                    return None;
                }
                Some((slot.last_used()?, model))
            })
            .collect();
        // Most recently used models come back first
        offloaded.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, model) in offloaded {
            let home = match self.model_status(&model) {
                Ok(status) => status.home_device,
                Err(_) => continue,
            };
            if self.monitor.pressure_for(home) != MemoryPressure::Normal {
                continue;
            }
            let (home_used, home_total) = match used.get(&home) {
                Some(&entry) => entry,
                None => continue,
            };
            let bytes = self.cache.model_bytes(&model) as u64;
            if ratio(home_used + bytes, home_total) > self.config.restore_threshold {
                continue;
            }

            match self.restore_model(&model) {
                Ok(RestoreOutcome::Restored { report: migration }) => {
                    let moved = migration.bytes as u64;
                    if let Some(entry) = used.get_mut(&home) {
                        entry.0 += moved;
                    }
                    if let Some(entry) = used.get_mut(&migration.from) {
                        entry.0 = entry.0.saturating_sub(moved);
                    }
                    report.restored.push(migration);
                }
                Ok(RestoreOutcome::InsufficientCapacity { .. })
                | Ok(RestoreOutcome::InUse { .. }) => {
                    report.deferred_restores.push(model);
                }
                Ok(RestoreOutcome::AlreadyResident) => {}
                Err(e) => report.failures.push((model, e.to_string())),
            }
        }

        if !report.is_idle() {
            tracing::debug!(
                offloaded = report.offloaded.len(),
                restored = report.restored.len(),
                failures = report.failures.len(),
                deferred = report.deferred_restores.len(),
                "offloader tick"
            );
        }
        report
    }

    pub fn model_state(&self, model: &str) -> ForgeResult<ModelState> {
        let slot = self.slot(model)?;
        let record = slot.record.lock()?;
        Ok(record.state)
    }

    pub fn model_status(&self, model: &str) -> ForgeResult<ModelStatus> {
        let slot = self.slot(model)?;
        let idle = slot
            .last_used()
            .map(|t| self.clock.now().saturating_duration_since(t))
            .unwrap_or_default();
        let record = slot.record.lock()?;
        Ok(ModelStatus {
            model: model.to_string(),
            state: record.state,
            home_device: record.home,
            in_flight: slot.in_flight.load(Ordering::SeqCst),
            cached_bytes: self.cache.model_bytes(model),
            idle,
            offloads: record.offloads,
            restores: record.restores,
            consecutive_failures: record.consecutive_failures,
            persistent_failure: record.persistent_failure.clone(),
            last_error: record.last_error.clone(),
        })
    }

    /// Status of every tracked model, sorted by name
    pub fn statuses(&self) -> Vec<ModelStatus> {
        let mut names: Vec<String> = self.slots().into_iter().map(|(m, _)| m).collect();
        names.sort();
        names
            .iter()
            .filter_map(|m| self.model_status(m).ok())
            .collect()
    }

    /// Re-enable automatic migration after a persistent failure
    pub fn clear_failure(&self, model: &str) -> ForgeResult<()> {
        let slot = self.slot(model)?;
        let mut record = slot.record.lock()?;
        Self::clear_failures(&mut record);
        Ok(())
    }

    pub fn counters(&self) -> OffloadCounters {
        OffloadCounters {
            offloads: self.counters.offloads.load(Ordering::Relaxed),
            restores: self.counters.restores.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            persistent_failures: self.counters.persistent_failures.load(Ordering::Relaxed),
        }
    }

    fn note_failure(&self, model: &str, record: &mut ModelRecord, err: &MemForgeError) {
        record.consecutive_failures += 1;
        record.last_error = Some(err.to_string());
        self.counters.failures.fetch_add(1, Ordering::Relaxed);

        if record.consecutive_failures > self.config.max_retries
            && record.persistent_failure.is_none()
        {
            record.persistent_failure = Some(err.to_string());
            self.counters
                .persistent_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                model,
                attempts = record.consecutive_failures,
                error = %err,
                state = %record.state,
                "migration failed persistently; model stays in place"
            );
        } else {
            tracing::warn!(
                model,
                attempt = record.consecutive_failures,
                max_retries = self.config.max_retries,
                error = %err,
                "migration failed; will retry"
            );
        }
    }

    fn clear_failures(record: &mut ModelRecord) {
        record.consecutive_failures = 0;
        record.persistent_failure = None;
        record.last_error = None;
    }

    fn as_migration_failure(model: &str, err: MemForgeError) -> MemForgeError {
        match err {
            MemForgeError::OffloadFailure { .. }
            | MemForgeError::MigrationTimeout { .. }
            | MemForgeError::OffloadCancelled(_) => err,
            other => MemForgeError::OffloadFailure {
                model: model.to_string(),
                reason: other.to_string(),
            },
        }
    }

    fn slot(&self, model: &str) -> ForgeResult<Arc<ModelSlot>> {
        self.models
            .read()?
            .get(model)
            .cloned()
            .ok_or_else(|| MemForgeError::UnknownModel(model.to_string()))
    }

    fn slots(&self) -> Vec<(String, Arc<ModelSlot>)> {
        self.models
            .read()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for AutomaticOffloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomaticOffloader")
            .field("config", &self.config)
            .field("models", &self.slots().len())
            .field("counters", &self.counters())
            .finish()
    }
}
