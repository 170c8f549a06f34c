//! LRU weight cache backed by the device pools
//!
//! Every cached layer owns exactly one pool block. The cache lock covers the
//! recency list, the key index and model placement; pool I/O for migrations
//! runs outside it and is committed atomically under it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::codec::{IdentityCodec, WeightCodec};
use super::lru::LruList;
use super::types::{
    CacheConfig, CacheEntry, CacheKey, CacheStats, EvictionOutcome, MigrationControl,
    MigrationReport,
};
use crate::clock::{Clock, SystemClock};
use crate::config_error;
use crate::device::Device;
use crate::error::{ForgeResult, MemForgeError};
use crate::internal_error;
use crate::memory::{MemoryBlock, MemoryPoolManager};

/// Attempts made by `get` when a block moves underneath a read
const READ_ATTEMPTS: usize = 3;

#[derive(Debug, Default)]
struct CacheState {
    lru: LruList<CacheEntry>,
    index: HashMap<CacheKey, usize>,
    /// Device each model's entries live on
    model_devices: HashMap<String, Device>,
    /// Whole-model pins taken by in-flight requests
    model_pins: HashMap<String, usize>,
    used_bytes: usize,
    evictions: u64,
    insertions: u64,
}

impl CacheState {
    fn is_evictable(&self, entry: &CacheEntry) -> bool {
        entry.pins == 0 && !entry.migrating && !self.model_pinned(&entry.key.model)
    }

    fn model_pinned(&self, model: &str) -> bool {
        self.model_pins.get(model).copied().unwrap_or(0) > 0
    }

    fn model_indices(&self, model: &str) -> Vec<usize> {
        self.lru
            .iter()
            .filter(|(_, e)| e.key.model == model)
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// LRU cache of model layer weights
///
/// Capacity is a byte budget with an optional entry-count budget. Entries are
/// evicted least recently used first; pinned and migrating entries are never
/// evicted.
///
/// # Example
///
/// ```rust,ignore
/// let cache = ModelWeightCache::new(CacheConfig::new(64 << 20), pools)?;
/// cache.put("llama-7b", "layers.0.attn", &weights)?;
/// let hit = cache.get("llama-7b", "layers.0.attn")?;
/// ```
pub struct ModelWeightCache {
    config: CacheConfig,
    pools: Arc<MemoryPoolManager>,
    codec: Arc<dyn WeightCodec>,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    /// Counted outside the lock, once the payload has actually been read
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ModelWeightCache {
    /// Create a cache allocating from `pools`
    ///
    /// # Errors
    /// - `InvalidConfiguration` for a zero byte or entry budget
    /// - `UnknownDevice` if the default device has no pool
    pub fn new(config: CacheConfig, pools: Arc<MemoryPoolManager>) -> ForgeResult<Self> {
        if config.capacity_bytes == 0 {
            return Err(config_error!("cache capacity must be non-zero"));
        }
        if config.max_entries == Some(0) {
            return Err(config_error!("cache entry budget must be at least 1"));
        }
        if !pools.has_device(config.default_device) {
            return Err(MemForgeError::UnknownDevice(config.default_device));
        }
        if config.compression {
            tracing::warn!(
                "cache_compression requested but no codec is installed; storing weights uncompressed"
            );
        }

        tracing::info!(
            capacity_bytes = config.capacity_bytes,
            max_entries = ?config.max_entries,
            device = %config.default_device,
            "ModelWeightCache created"
        );

        Ok(Self {
            config,
            pools,
            codec: Arc::new(IdentityCodec),
            clock: Arc::new(SystemClock),
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Install a payload codec
    pub fn with_codec(mut self, codec: Arc<dyn WeightCodec>) -> Self {
        tracing::debug!(codec = codec.name(), "weight codec installed");
        self.codec = codec;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<MemoryPoolManager> {
        &self.pools
    }

    pub fn capacity_bytes(&self) -> usize {
        self.config.capacity_bytes
    }

    /// Look up a layer, marking it most recently used
    ///
    /// The pool read normally runs outside the cache lock and is retried if
    /// a migration moved the block in between; the last attempt reads under
    /// the lock, where no commit can interleave.
    pub fn get(&self, model: &str, layer: &str) -> ForgeResult<Option<Vec<u8>>> {
        let key = CacheKey::new(model, layer);

        for attempt in 1..=READ_ATTEMPTS {
            let mut guard = self.state.lock()?;
            let state = &mut *guard;
            let idx = match state.index.get(&key) {
                Some(&idx) => idx,
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            };
            state.lru.touch(idx);
            let now = self.clock.now();
            let entry = state
                .lru
                .get_mut(idx)
                .ok_or_else(|| internal_error!("index points at empty slot for {}", key))?;
            entry.last_access = now;
            let block = entry.block.clone();

            if attempt == READ_ATTEMPTS {
                let stored = self.pools.read(&block)?;
                drop(guard);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return self.codec.decode(&stored).map(Some);
            }
            drop(guard);

            match self.pools.read(&block) {
                Ok(stored) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return self.codec.decode(&stored).map(Some);
                }
                Err(MemForgeError::InvalidBlock(_)) => {
                    tracing::trace!(key = %key, attempt, "cached block moved during read, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(internal_error!("no read attempt made for {}", key))
    }

    /// Insert or replace a layer
    ///
    /// # Errors
    /// - `CacheEntryTooLarge` if the payload exceeds the whole budget
    /// - `CacheExhausted` if pinned entries prevent making room
    /// - `OutOfMemory` if the pool stays full after evicting everything
    ///   evictable on the model's device
    pub fn put(&self, model: &str, layer: &str, weights: &[u8]) -> ForgeResult<()> {
        let stored = self.codec.encode(weights)?;
        let size = stored.len();
        if size == 0 {
            return Err(MemForgeError::InvalidAllocation(
                "cannot cache an empty payload".to_string(),
            ));
        }
        if size > self.config.capacity_bytes {
            return Err(MemForgeError::CacheEntryTooLarge {
                size,
                capacity: self.config.capacity_bytes,
            });
        }

        let key = CacheKey::new(model, layer);
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        let device = state
            .model_devices
            .get(model)
            .copied()
            .unwrap_or(self.config.default_device);
        let existing = state.index.get(&key).copied();

        self.make_room(state, size, existing)?;
        let block = self.allocate_with_eviction(state, size, device, existing)?;
        if let Err(e) = self.pools.write(&block, &stored) {
            self.release_block(block);
            return Err(e);
        }

        let now = self.clock.now();
        match existing {
            Some(idx) => {
                let entry = state
                    .lru
                    .get_mut(idx)
                    .ok_or_else(|| internal_error!("index points at empty slot for {}", key))?;
                let old_block = std::mem::replace(&mut entry.block, block);
                let old_size = entry.size;
                entry.size = size;
                entry.migrating = false;
                entry.last_access = now;
                state.lru.touch(idx);
                state.used_bytes = state.used_bytes - old_size + size;
                self.release_block(old_block);
            }
            None => {
                let idx = state.lru.push_back(CacheEntry {
                    key: key.clone(),
                    block,
                    size,
                    pins: 0,
                    migrating: false,
                    last_access: now,
                });
                state.index.insert(key.clone(), idx);
                state.used_bytes += size;
            }
        }
        state.model_devices.entry(model.to_string()).or_insert(device);
        state.insertions += 1;

        tracing::debug!(
            key = %key,
            size,
            device = %device,
            used_bytes = state.used_bytes,
            "cached weights"
        );
        Ok(())
    }

    /// Evict least recently used entries until at least `target_size` bytes
    /// of the cache budget are free
    ///
    /// Space that is already free counts, so nothing is evicted when the
    /// budget has room. Pinned and migrating entries are skipped.
    /// `satisfied` is false when not enough evictable bytes existed.
    pub fn evict_least_recently_used(&self, target_size: usize) -> ForgeResult<EvictionOutcome> {
        let capacity = self.config.capacity_bytes;
        self.evict_matching(
            target_size,
            |_| true,
            |used, _| capacity.saturating_sub(used) >= target_size,
        )
    }

    /// Evict least recently used entries living on `device` until
    /// `target_size` bytes have been released back to its pool
    pub fn evict_from_device(&self, device: Device, target_size: usize) -> ForgeResult<EvictionOutcome> {
        self.evict_matching(
            target_size,
            |e| e.block.device() == device,
            |_, freed| freed >= target_size,
        )
    }

    /// Protect one layer from eviction (counted)
    pub fn pin(&self, model: &str, layer: &str) -> ForgeResult<bool> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let key = CacheKey::new(model, layer);
        match state.index.get(&key).copied().and_then(|idx| state.lru.get_mut(idx)) {
            Some(entry) => {
                entry.pins += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release one pin on a layer
    pub fn unpin(&self, model: &str, layer: &str) -> ForgeResult<bool> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let key = CacheKey::new(model, layer);
        match state.index.get(&key).copied().and_then(|idx| state.lru.get_mut(idx)) {
            Some(entry) if entry.pins > 0 => {
                entry.pins -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Protect every current and future layer of a model (counted)
    pub fn pin_model(&self, model: &str) -> ForgeResult<()> {
        let mut state = self.state.lock()?;
        *state.model_pins.entry(model.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Release one whole-model pin; returns false if none was held
    pub fn unpin_model(&self, model: &str) -> ForgeResult<bool> {
        let mut state = self.state.lock()?;
        match state.model_pins.get_mut(model) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(true)
            }
            Some(_) => {
                state.model_pins.remove(model);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether any layer of the model, or the model itself, is pinned
    pub fn is_model_pinned(&self, model: &str) -> ForgeResult<bool> {
        let state = self.state.lock()?;
        if state.model_pinned(model) {
            return Ok(true);
        }
        Ok(state
            .lru
            .iter()
            .any(|(_, e)| e.key.model == model && e.pins > 0))
    }

    /// Drop one layer regardless of pins
    pub fn invalidate(&self, model: &str, layer: &str) -> ForgeResult<bool> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let key = CacheKey::new(model, layer);
        match state.index.get(&key).copied() {
            Some(idx) => Ok(self.remove_entry(state, idx).is_some()),
            None => Ok(false),
        }
    }

    /// Drop every layer of a model and forget its placement
    pub fn invalidate_model(&self, model: &str) -> ForgeResult<usize> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let mut removed = 0;
        for idx in state.model_indices(model) {
            if self.remove_entry(state, idx).is_some() {
                removed += 1;
            }
        }
        state.model_devices.remove(model);
        tracing::debug!(model, removed, "invalidated model");
        Ok(removed)
    }

    /// Presence check that does not touch recency
    pub fn contains(&self, model: &str, layer: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.index.contains_key(&CacheKey::new(model, layer)))
            .unwrap_or(false)
    }

    /// Set where a model's entries are allocated
    ///
    /// Only allowed while the model has no cached layers; moving a populated
    /// model goes through [`migrate_model`](Self::migrate_model).
    pub fn set_model_device(&self, model: &str, device: Device) -> ForgeResult<()> {
        if !self.pools.has_device(device) {
            return Err(MemForgeError::UnknownDevice(device));
        }
        let mut state = self.state.lock()?;
        if let Some(&current) = state.model_devices.get(model) {
            if current != device && !state.model_indices(model).is_empty() {
                return Err(MemForgeError::InvalidStateTransition {
                    model: model.to_string(),
                    from: current.to_string(),
                    to: device.to_string(),
                });
            }
        }
        state.model_devices.insert(model.to_string(), device);
        Ok(())
    }

    pub fn model_device(&self, model: &str) -> Option<Device> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.model_devices.get(model).copied())
    }

    /// Bytes cached for a model
    pub fn model_bytes(&self, model: &str) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.lru
                    .iter()
                    .filter(|(_, e)| e.key.model == model)
                    .map(|(_, e)| e.size)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Layers cached for a model, least recently used first
    pub fn model_layers(&self, model: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                s.lru
                    .iter()
                    .filter(|(_, e)| e.key.model == model)
                    .map(|(_, e)| e.key.layer.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent access to any layer of the model
    pub fn model_last_access(&self, model: &str) -> Option<Instant> {
        let state = self.state.lock().ok()?;
        state
            .lru
            .iter()
            .filter(|(_, e)| e.key.model == model)
            .map(|(_, e)| e.last_access)
            .max()
    }

    /// Models with a known placement
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .state
            .lock()
            .map(|s| s.model_devices.keys().cloned().collect())
            .unwrap_or_default();
        models.sort();
        models
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().map(|s| s.used_bytes).unwrap_or(0)
    }

    pub fn stats(&self) -> ForgeResult<CacheStats> {
        let state = self.state.lock()?;
        let pinned_entries = state
            .lru
            .iter()
            .filter(|(_, e)| e.pins > 0 || state.model_pinned(&e.key.model))
            .count();
        Ok(CacheStats {
            entries: state.lru.len(),
            used_bytes: state.used_bytes,
            capacity_bytes: self.config.capacity_bytes,
            max_entries: self.config.max_entries,
            pinned_entries,
            models: state.model_devices.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: state.evictions,
            insertions: state.insertions,
        })
    }

    /// Move every layer of a model to `target`
    ///
    /// Two-phase: layers are copied to the target pool and read back for
    /// verification outside the cache lock, then the new blocks are committed
    /// under the lock and only then are the source blocks released. Any
    /// failure (allocation, verification, cancellation, deadline, or layers
    /// changing underneath) frees the target blocks and leaves the model on
    /// its source device.
    pub fn migrate_model(
        &self,
        model: &str,
        target: Device,
        control: &MigrationControl<'_>,
    ) -> ForgeResult<MigrationReport> {
        if !self.pools.has_device(target) {
            return Err(MemForgeError::UnknownDevice(target));
        }
        let started = self.clock.now();

        let (source, snapshot) = self.begin_migration(model, target)?;
        if snapshot.is_empty() {
            return Ok(MigrationReport {
                model: model.to_string(),
                from: source,
                to: target,
                entries: 0,
                bytes: 0,
                elapsed: self.clock.now().saturating_duration_since(started),
            });
        }

        let mut copied = Vec::with_capacity(snapshot.len());
        let result = self
            .copy_entries(model, &snapshot, target, control, started, &mut copied)
            .and_then(|_| self.commit_migration(model, target, &snapshot, &copied));

        match result {
            Ok(bytes) => {
                for (_, _, src) in snapshot.iter().cloned() {
                    self.release_block(src);
                }
                let elapsed = self.clock.now().saturating_duration_since(started);
                tracing::info!(
                    model,
                    from = %source,
                    to = %target,
                    entries = snapshot.len(),
                    bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "model migrated"
                );
                Ok(MigrationReport {
                    model: model.to_string(),
                    from: source,
                    to: target,
                    entries: snapshot.len(),
                    bytes,
                    elapsed,
                })
            }
            Err(e) => {
                for block in copied {
                    self.release_block(block);
                }
                self.clear_migrating(&snapshot);
                tracing::warn!(
                    model,
                    from = %source,
                    to = %target,
                    error = %e,
                    "migration rolled back"
                );
                Err(e)
            }
        }
    }

    /// Snapshot a model's layers and mark them migrating
    fn begin_migration(
        &self,
        model: &str,
        target: Device,
    ) -> ForgeResult<(Device, Vec<(usize, CacheKey, MemoryBlock)>)> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        let source = *state
            .model_devices
            .get(model)
            .ok_or_else(|| MemForgeError::UnknownModel(model.to_string()))?;
        if source == target {
            return Err(MemForgeError::InvalidStateTransition {
                model: model.to_string(),
                from: source.to_string(),
                to: target.to_string(),
            });
        }
        if state.model_pinned(model) {
            return Err(MemForgeError::OffloadFailure {
                model: model.to_string(),
                reason: "model is pinned by an in-flight request".to_string(),
            });
        }

        let mut snapshot = Vec::new();
        for idx in state.model_indices(model) {
            let entry = state
                .lru
                .get(idx)
                .ok_or_else(|| internal_error!("recency list slot {} vanished", idx))?;
            if entry.pins > 0 {
                return Err(MemForgeError::OffloadFailure {
                    model: model.to_string(),
                    reason: format!("layer {} is pinned", entry.key.layer),
                });
            }
            if entry.migrating {
                return Err(MemForgeError::OffloadFailure {
                    model: model.to_string(),
                    reason: "a migration is already in progress".to_string(),
                });
            }
            snapshot.push((idx, entry.key.clone(), entry.block.clone()));
        }

        for (idx, _, _) in &snapshot {
            if let Some(entry) = state.lru.get_mut(*idx) {
                entry.migrating = true;
            }
        }
        if snapshot.is_empty() {
            state.model_devices.insert(model.to_string(), target);
        }

        Ok((source, snapshot))
    }

    fn copy_entries(
        &self,
        model: &str,
        snapshot: &[(usize, CacheKey, MemoryBlock)],
        target: Device,
        control: &MigrationControl<'_>,
        started: Instant,
        copied: &mut Vec<MemoryBlock>,
    ) -> ForgeResult<()> {
        let failure = |reason: String| MemForgeError::OffloadFailure {
            model: model.to_string(),
            reason,
        };

        for (_, key, src) in snapshot {
            self.check_control(model, control, started)?;

            let dst = self
                .pools
                .allocate(src.size(), target)
                .map_err(|e| failure(format!("allocating {} on {}: {}", key, target, e)))?;
            copied.push(dst.clone());

            let data = self
                .pools
                .read(src)
                .map_err(|e| failure(format!("reading {}: {}", key, e)))?;
            self.pools
                .write(&dst, &data)
                .map_err(|e| failure(format!("writing {} to {}: {}", key, target, e)))?;

            let written = self
                .pools
                .read(&dst)
                .map_err(|e| failure(format!("verifying {}: {}", key, e)))?;
            if written != data {
                return Err(failure(format!("verification mismatch for {}", key)));
            }
        }

        self.check_control(model, control, started)
    }

    /// Swap in the target blocks if no layer changed since the snapshot
    fn commit_migration(
        &self,
        model: &str,
        target: Device,
        snapshot: &[(usize, CacheKey, MemoryBlock)],
        copied: &[MemoryBlock],
    ) -> ForgeResult<usize> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        // Layers added since the snapshot would stay behind on the source
        let unchanged = state.model_indices(model).len() == snapshot.len()
            && snapshot.iter().all(|(idx, key, src)| {
                state.index.get(key) == Some(idx)
                    && state
                        .lru
                        .get(*idx)
                        .map(|e| e.migrating && &e.block == src)
                        .unwrap_or(false)
            });
        if !unchanged {
            return Err(MemForgeError::OffloadFailure {
                model: model.to_string(),
                reason: "cached layers changed during migration".to_string(),
            });
        }

        let mut bytes = 0;
        for ((idx, _, _), dst) in snapshot.iter().zip(copied.iter()) {
            if let Some(entry) = state.lru.get_mut(*idx) {
                entry.block = dst.clone();
                entry.migrating = false;
                bytes += entry.size;
            }
        }
        state.model_devices.insert(model.to_string(), target);
        Ok(bytes)
    }

    fn clear_migrating(&self, snapshot: &[(usize, CacheKey, MemoryBlock)]) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!(error = %e, "cache lock poisoned while rolling back migration");
                return;
            }
        };
        let state = &mut *guard;
        for (idx, key, src) in snapshot {
            if state.index.get(key) != Some(idx) {
                continue;
            }
            if let Some(entry) = state.lru.get_mut(*idx) {
                if &entry.block == src {
                    entry.migrating = false;
                }
            }
        }
    }

    fn check_control(
        &self,
        model: &str,
        control: &MigrationControl<'_>,
        started: Instant,
    ) -> ForgeResult<()> {
        if control.is_cancelled() {
            return Err(MemForgeError::OffloadCancelled(model.to_string()));
        }
        if let Some(deadline) = control.deadline {
            let now = self.clock.now();
            if now >= deadline {
                return Err(MemForgeError::MigrationTimeout {
                    model: model.to_string(),
                    elapsed_ms: now.saturating_duration_since(started).as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Evict LRU entries until the new payload fits both budgets
    fn make_room(
        &self,
        state: &mut CacheState,
        size: usize,
        replacing: Option<usize>,
    ) -> ForgeResult<()> {
        let capacity = self.config.capacity_bytes;
        let max_entries = self.config.max_entries;
        let replaced_size = replacing
            .and_then(|idx| state.lru.get(idx))
            .map(|e| e.size)
            .unwrap_or(0);
        let added = usize::from(replacing.is_none());

        let fits = |used: usize, count: usize| {
            used - replaced_size + size <= capacity
                && max_entries.map_or(true, |max| count + added <= max)
        };

        if fits(state.used_bytes, state.lru.len()) {
            return Ok(());
        }

        // Plan the victims first so nothing is evicted for an insert that
        // cannot succeed
        let mut victims = Vec::new();
        let mut used = state.used_bytes;
        let mut count = state.lru.len();
        for (idx, entry) in state.lru.iter() {
            if fits(used, count) {
                break;
            }
            if Some(idx) == replacing || !state.is_evictable(entry) {
                continue;
            }
            victims.push(idx);
            used -= entry.size;
            count -= 1;
        }

        if !fits(used, count) {
            let evictable = state.used_bytes - used;
            tracing::warn!(
                size,
                used_bytes = state.used_bytes,
                evictable,
                "cache exhausted by pinned entries"
            );
            return Err(MemForgeError::CacheExhausted {
                needed: size,
                evictable,
            });
        }

        for idx in victims {
            if let Some((key, freed)) = self.remove_entry(state, idx) {
                state.evictions += 1;
                tracing::debug!(key = %key, freed, "evicted to make room");
            }
        }
        Ok(())
    }

    /// Allocate, evicting same-device LRU entries while the pool is full
    fn allocate_with_eviction(
        &self,
        state: &mut CacheState,
        size: usize,
        device: Device,
        replacing: Option<usize>,
    ) -> ForgeResult<MemoryBlock> {
        loop {
            match self.pools.allocate(size, device) {
                Ok(block) => return Ok(block),
                Err(err @ MemForgeError::OutOfMemory { .. }) => {
                    let victim = state
                        .lru
                        .iter()
                        .find(|&(idx, e)| {
                            Some(idx) != replacing
                                && e.block.device() == device
                                && state.is_evictable(e)
                        })
                        .map(|(idx, _)| idx);

                    match victim {
                        Some(idx) => {
                            if let Some((key, freed)) = self.remove_entry(state, idx) {
                                state.evictions += 1;
                                tracing::debug!(
                                    key = %key,
                                    freed,
                                    device = %device,
                                    "evicted to relieve pool"
                                );
                            }
                        }
                        None => return Err(err),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Evict matching entries in LRU order until `done(used, freed)` holds
    fn evict_matching<F, D>(
        &self,
        target_size: usize,
        matches: F,
        done: D,
    ) -> ForgeResult<EvictionOutcome>
    where
        F: Fn(&CacheEntry) -> bool,
        D: Fn(usize, usize) -> bool,
    {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        let mut victims = Vec::new();
        let mut used = state.used_bytes;
        let mut planned = 0;
        for (idx, entry) in state.lru.iter() {
            if done(used, planned) {
                break;
            }
            if state.is_evictable(entry) && matches(entry) {
                victims.push(idx);
                used -= entry.size;
                planned += entry.size;
            }
        }

        let mut outcome = EvictionOutcome::default();
        for idx in victims {
            if let Some((key, freed)) = self.remove_entry(state, idx) {
                state.evictions += 1;
                outcome.freed_bytes += freed;
                outcome.evicted.push(key);
            }
        }
        outcome.satisfied = done(state.used_bytes, outcome.freed_bytes);

        if outcome.satisfied {
            tracing::debug!(
                target_size,
                freed = outcome.freed_bytes,
                evicted = outcome.evicted.len(),
                used_bytes = state.used_bytes,
                "LRU eviction"
            );
        } else {
            tracing::warn!(
                target_size,
                freed = outcome.freed_bytes,
                used_bytes = state.used_bytes,
                "LRU eviction fell short; remaining entries are pinned or migrating"
            );
        }
        Ok(outcome)
    }

    fn remove_entry(&self, state: &mut CacheState, idx: usize) -> Option<(CacheKey, usize)> {
        let entry = state.lru.remove(idx)?;
        state.index.remove(&entry.key);
        state.used_bytes -= entry.size;
        self.release_block(entry.block);
        Some((entry.key, entry.size))
    }

    fn release_block(&self, block: MemoryBlock) {
        let device = block.device();
        if let Err(e) = self.pools.deallocate(block) {
            tracing::error!(device = %device, error = %e, "failed to release cache block");
        }
    }
}

impl std::fmt::Debug for ModelWeightCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelWeightCache")
            .field("config", &self.config)
            .field("codec", &self.codec.name())
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}
