//! Multi-device pool manager
//!
//! Owns one [`DevicePool`] per configured device. Each pool sits behind its
//! own mutex, so allocations on different devices never contend. A lock-free
//! statistics mirror is refreshed after every mutation so that
//! [`MemoryPoolManager::get_pool_stats`] never waits on an allocator.

use std::collections::BTreeMap;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::block::MemoryBlock;
use super::pool::{DevicePool, PoolStats};
use crate::config::MemoryConfig;
use crate::device::Device;
use crate::error::{ForgeResult, MemForgeError};
use crate::monitor::{DeviceUsage, MemoryPressure, MemoryUsageSource};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Statistics readable without taking the pool lock
///
/// Sequence-locked: `version` is odd while a refresh is in progress and
/// readers retry until they see the same even version on both sides of
/// their reads. Refreshes happen under the pool mutex, so there is only
/// ever one writer.
#[derive(Debug, Default)]
struct StatsMirror {
    version: AtomicU64,
    used: AtomicUsize,
    free: AtomicUsize,
    largest_free: AtomicUsize,
    fragment_count: AtomicUsize,
    fragmentation_bits: AtomicU64,
    live: AtomicUsize,
    high_water: AtomicUsize,
    total_allocations: AtomicU64,
    failed_allocations: AtomicU64,
}

impl StatsMirror {
    fn refresh(&self, pool: &DevicePool) {
        let stats = pool.stats();
        let version = self.version.load(Ordering::Relaxed);
        self.version.store(version.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.used.store(stats.used_bytes, Ordering::Relaxed);
        self.free.store(stats.free_bytes, Ordering::Relaxed);
        self.largest_free.store(stats.largest_free, Ordering::Relaxed);
        self.fragment_count
            .store(stats.fragment_count, Ordering::Relaxed);
        self.fragmentation_bits
            .store(stats.fragmentation.to_bits(), Ordering::Relaxed);
        self.live.store(stats.live_allocations, Ordering::Relaxed);
        self.high_water
            .store(stats.high_water_mark, Ordering::Relaxed);
        self.total_allocations
            .store(stats.total_allocations, Ordering::Relaxed);
        self.failed_allocations
            .store(stats.failed_allocations, Ordering::Relaxed);

        self.version.store(version.wrapping_add(2), Ordering::Release);
    }

    fn snapshot(&self, device: Device, capacity: usize) -> PoolStats {
        loop {
            let before = self.version.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let stats = PoolStats {
                device,
                capacity,
                used_bytes: self.used.load(Ordering::Relaxed),
                free_bytes: self.free.load(Ordering::Relaxed),
                largest_free: self.largest_free.load(Ordering::Relaxed),
                fragment_count: self.fragment_count.load(Ordering::Relaxed),
                fragmentation: f64::from_bits(self.fragmentation_bits.load(Ordering::Relaxed)),
                live_allocations: self.live.load(Ordering::Relaxed),
                high_water_mark: self.high_water.load(Ordering::Relaxed),
                total_allocations: self.total_allocations.load(Ordering::Relaxed),
                failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            };

            fence(Ordering::Acquire);
            if self.version.load(Ordering::Relaxed) == before {
                return stats;
            }
        }
    }
}

#[derive(Debug)]
struct PoolSlot {
    capacity: usize,
    pool: Mutex<DevicePool>,
    mirror: StatsMirror,
}

/// Per-device memory pools
///
/// Instances are independent: blocks issued by one manager are rejected by
/// every other manager.
///
/// # Example
///
/// ```rust,ignore
/// use std::collections::BTreeMap;
/// use memforge::{Device, MemoryPoolManager};
///
/// let mut sizes = BTreeMap::new();
/// sizes.insert(Device::Gpu(0), 64 * 1024 * 1024);
/// let pools = MemoryPoolManager::new(&sizes, 256)?;
///
/// let block = pools.allocate(4096, Device::Gpu(0))?;
/// pools.write(&block, &weights)?;
/// pools.deallocate(block)?;
/// ```
#[derive(Debug)]
pub struct MemoryPoolManager {
    id: u64,
    pools: BTreeMap<Device, PoolSlot>,
}

impl MemoryPoolManager {
    /// Create one pool per entry of `pool_sizes`
    ///
    /// # Errors
    /// - no pools configured
    /// - a zero capacity or non power-of-two alignment
    pub fn new(pool_sizes: &BTreeMap<Device, u64>, alignment: usize) -> ForgeResult<Self> {
        if pool_sizes.is_empty() {
            return Err(MemForgeError::InvalidConfiguration(
                "at least one device pool is required".to_string(),
            ));
        }

        let mut pools = BTreeMap::new();
        for (&device, &size) in pool_sizes {
            let capacity = usize::try_from(size).map_err(|_| {
                MemForgeError::InvalidConfiguration(format!(
                    "pool size {} for {} does not fit in memory",
                    size, device
                ))
            })?;
            let pool = DevicePool::new(device, capacity, alignment)?;
            let mirror = StatsMirror::default();
            mirror.refresh(&pool);
            pools.insert(
                device,
                PoolSlot {
                    capacity,
                    pool: Mutex::new(pool),
                    mirror,
                },
            );
        }

        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(manager_id = id, pools = pools.len(), "MemoryPoolManager created");

        Ok(Self { id, pools })
    }

    /// Build from the `pool_sizes` and `pool_alignment` settings
    pub fn from_config(config: &MemoryConfig) -> ForgeResult<Self> {
        Self::new(&config.pool_sizes, config.pool_alignment)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Devices with a configured pool
    pub fn devices(&self) -> Vec<Device> {
        self.pools.keys().copied().collect()
    }

    pub fn has_device(&self, device: Device) -> bool {
        self.pools.contains_key(&device)
    }

    /// Allocate at least `size` bytes on `device`
    ///
    /// # Errors
    /// - `UnknownDevice` if no pool exists for the device
    /// - `OutOfMemory` if the pool cannot satisfy the request; the caller may
    ///   retry after evicting elsewhere
    pub fn allocate(&self, size: usize, device: Device) -> ForgeResult<MemoryBlock> {
        let slot = self.slot(device)?;
        let mut pool = slot.pool.lock()?;
        let result = pool.allocate(size);
        slot.mirror.refresh(&pool);
        drop(pool);

        match result {
            Ok(alloc) => Ok(MemoryBlock {
                device,
                manager_id: self.id,
                offset: alloc.offset,
                size: alloc.size,
                generation: alloc.generation,
            }),
            Err(e) => {
                tracing::debug!(device = %device, size, error = %e, "allocation failed");
                Err(e)
            }
        }
    }

    /// Return a block to its device pool
    ///
    /// # Errors
    /// - `InvalidBlock` for a double free, a stale descriptor, or a block
    ///   issued by a different manager
    pub fn deallocate(&self, block: MemoryBlock) -> ForgeResult<()> {
        self.check_owner(&block)?;
        let slot = self.slot(block.device)?;
        let mut pool = slot.pool.lock()?;
        let result = pool.release(block.offset, block.generation);
        slot.mirror.refresh(&pool);
        result.map(|_| ())
    }

    /// Copy payload bytes into a block
    pub fn write(&self, block: &MemoryBlock, data: &[u8]) -> ForgeResult<()> {
        self.check_owner(block)?;
        let slot = self.slot(block.device)?;
        let mut pool = slot.pool.lock()?;
        pool.write(block.offset, block.generation, data)
    }

    /// Copy a block's payload out
    pub fn read(&self, block: &MemoryBlock) -> ForgeResult<Vec<u8>> {
        self.check_owner(block)?;
        let slot = self.slot(block.device)?;
        let pool = slot.pool.lock()?;
        pool.read(block.offset, block.generation)
    }

    /// Whether the block is still live in this manager
    pub fn is_live(&self, block: &MemoryBlock) -> bool {
        if block.manager_id != self.id {
            return false;
        }
        match self.pools.get(&block.device) {
            Some(slot) => slot
                .pool
                .lock()
                .map(|pool| pool.is_live(block.offset, block.generation))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Consistent snapshot of one device pool, read without locking the
    /// allocator
    pub fn get_pool_stats(&self, device: Device) -> ForgeResult<PoolStats> {
        let slot = self.slot(device)?;
        Ok(slot.mirror.snapshot(device, slot.capacity))
    }

    /// Snapshots of every pool, ordered by device
    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.pools
            .keys()
            .filter_map(|&device| self.get_pool_stats(device).ok())
            .collect()
    }

    /// Run the coalescing pass on one pool
    pub fn coalesce(&self, device: Device) -> ForgeResult<usize> {
        let slot = self.slot(device)?;
        let mut pool = slot.pool.lock()?;
        let merges = pool.coalesce();
        slot.mirror.refresh(&pool);
        Ok(merges)
    }

    /// Periodic cleanup driven by memory pressure
    ///
    /// Coalesces every pool once pressure reaches Warning. Returns the
    /// total number of merges.
    pub fn cleanup(&self, pressure: MemoryPressure) -> ForgeResult<usize> {
        if pressure < MemoryPressure::Warning {
            return Ok(0);
        }

        let mut merges = 0;
        for &device in self.pools.keys() {
            merges += self.coalesce(device)?;
        }

        tracing::debug!(pressure = %pressure, merges, "pool cleanup pass");
        Ok(merges)
    }

    fn slot(&self, device: Device) -> ForgeResult<&PoolSlot> {
        self.pools
            .get(&device)
            .ok_or(MemForgeError::UnknownDevice(device))
    }

    fn check_owner(&self, block: &MemoryBlock) -> ForgeResult<()> {
        if block.manager_id != self.id {
            return Err(MemForgeError::InvalidBlock(format!(
                "block on {} at offset {} was issued by manager {}, not {}",
                block.device, block.offset, block.manager_id, self.id
            )));
        }
        if !self.pools.contains_key(&block.device) {
            return Err(MemForgeError::InvalidBlock(format!(
                "block refers to unmanaged device {}",
                block.device
            )));
        }
        Ok(())
    }
}

impl MemoryUsageSource for MemoryPoolManager {
    fn name(&self) -> &str {
        "memory-pools"
    }

    fn sample(&self) -> Vec<DeviceUsage> {
        self.all_stats()
            .into_iter()
            .map(|s| DeviceUsage {
                device: s.device,
                used_bytes: s.used_bytes as u64,
                total_bytes: s.capacity as u64,
                fragmentation: Some(s.fragmentation),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(sizes: &[(Device, u64)]) -> MemoryPoolManager {
        let sizes: BTreeMap<Device, u64> = sizes.iter().copied().collect();
        MemoryPoolManager::new(&sizes, DevicePool::DEFAULT_ALIGNMENT).unwrap()
    }

    #[test]
    fn test_allocate_on_each_device() {
        let pools = manager(&[(Device::Gpu(0), 4096), (Device::Cpu, 8192)]);

        let gpu = pools.allocate(1000, Device::Gpu(0)).unwrap();
        let cpu = pools.allocate(2000, Device::Cpu).unwrap();

        assert_eq!(gpu.device(), Device::Gpu(0));
        assert_eq!(cpu.device(), Device::Cpu);
        assert_eq!(pools.get_pool_stats(Device::Gpu(0)).unwrap().used_bytes, 1000);
        assert_eq!(pools.get_pool_stats(Device::Cpu).unwrap().used_bytes, 2000);
    }

    #[test]
    fn test_unknown_device() {
        let pools = manager(&[(Device::Gpu(0), 4096)]);
        let err = pools.allocate(10, Device::Gpu(7)).unwrap_err();
        assert!(matches!(err, MemForgeError::UnknownDevice(Device::Gpu(7))));
    }

    #[test]
    fn test_double_free_detected() {
        let pools = manager(&[(Device::Gpu(0), 4096)]);
        let block = pools.allocate(100, Device::Gpu(0)).unwrap();

        pools.deallocate(block.clone()).unwrap();
        let err = pools.deallocate(block).unwrap_err();
        assert!(matches!(err, MemForgeError::InvalidBlock(_)));
    }

    #[test]
    fn test_foreign_block_rejected() {
        let a = manager(&[(Device::Gpu(0), 4096)]);
        let b = manager(&[(Device::Gpu(0), 4096)]);

        let block = a.allocate(100, Device::Gpu(0)).unwrap();
        let err = b.deallocate(block.clone()).unwrap_err();
        assert!(matches!(err, MemForgeError::InvalidBlock(_)));
        assert!(!b.is_live(&block));
        assert!(a.is_live(&block));
    }

    #[test]
    fn test_write_read_through_manager() {
        let pools = manager(&[(Device::Cpu, 4096)]);
        let block = pools.allocate(3, Device::Cpu).unwrap();
        pools.write(&block, b"abc").unwrap();
        assert_eq!(pools.read(&block).unwrap(), b"abc".to_vec());

        pools.deallocate(block.clone()).unwrap();
        assert!(pools.read(&block).is_err());
    }

    #[test]
    fn test_stats_mirror_tracks_mutations() {
        let pools = manager(&[(Device::Gpu(0), 4096)]);
        let block = pools.allocate(1024, Device::Gpu(0)).unwrap();

        let stats = pools.get_pool_stats(Device::Gpu(0)).unwrap();
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.used_bytes + stats.free_bytes, stats.capacity);
        assert_eq!(stats.total_allocations, 1);

        pools.deallocate(block).unwrap();
        let stats = pools.get_pool_stats(Device::Gpu(0)).unwrap();
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.free_bytes, 4096);
        assert_eq!(stats.high_water_mark, 1024);
    }

    #[test]
    fn test_stats_snapshots_are_consistent_under_churn() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let pools = Arc::new(manager(&[(Device::Gpu(0), 64 * 1024)]));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let pools = Arc::clone(&pools);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0;
                while !done.load(Ordering::SeqCst) || reads < 1000 {
                    let stats = pools.get_pool_stats(Device::Gpu(0)).unwrap();
                    assert_eq!(stats.used_bytes + stats.free_bytes, stats.capacity);
                    assert!(stats.largest_free <= stats.free_bytes);
                    assert_eq!(stats.live_allocations == 0, stats.used_bytes == 0);
                    reads += 1;
                }
            })
        };

        for round in 0..2000usize {
            let size = 256 * (1 + round % 7);
            let block = pools.allocate(size, Device::Gpu(0)).unwrap();
            pools.deallocate(block).unwrap();
        }
        done.store(true, Ordering::SeqCst);
        reader.join().unwrap();
    }

    #[test]
    fn test_cleanup_skipped_under_normal_pressure() {
        let pools = manager(&[(Device::Gpu(0), 4096)]);
        assert_eq!(pools.cleanup(MemoryPressure::Normal).unwrap(), 0);
        assert_eq!(pools.cleanup(MemoryPressure::Critical).unwrap(), 0);
    }

    #[test]
    fn test_usage_source_reports_every_pool() {
        let pools = manager(&[(Device::Gpu(0), 4096), (Device::Cpu, 8192)]);
        pools.allocate(1024, Device::Gpu(0)).unwrap();

        let usage = pools.sample();
        assert_eq!(usage.len(), 2);
        let gpu = usage.iter().find(|u| u.device == Device::Gpu(0)).unwrap();
        assert_eq!(gpu.used_bytes, 1024);
        assert_eq!(gpu.total_bytes, 4096);
    }

    #[test]
    fn test_empty_config_rejected() {
        let sizes = BTreeMap::new();
        assert!(MemoryPoolManager::new(&sizes, 256).is_err());
    }
}
