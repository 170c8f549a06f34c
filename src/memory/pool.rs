//! Per-device memory arena
//!
//! One fixed-capacity region per device, subdivided with best-fit free block
//! allocation. Slack too small to be worth tracking is folded into the
//! neighbouring allocation, so every byte of capacity is always either in a
//! free region or inside exactly one live allocation.

use std::collections::HashMap;

use serde::Serialize;

use crate::device::Device;
use crate::error::{ForgeResult, MemForgeError};

/// Free region within the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRegion {
    /// Byte offset from arena start
    offset: usize,
    /// Size in bytes
    size: usize,
}

impl FreeRegion {
    fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Check if this region is immediately before another region
    fn is_adjacent_to(&self, other: &FreeRegion) -> bool {
        self.end() == other.offset
    }
}

/// Live allocation bookkeeping
#[derive(Debug, Clone, Copy)]
struct Allocation {
    /// Start of the reserved region (may precede `offset` by alignment padding)
    region_start: usize,
    /// Reserved bytes, including folded padding and tail slack
    region_len: usize,
    /// Requested size
    size: usize,
    generation: u64,
}

/// Result of a successful arena allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAllocation {
    pub offset: usize,
    pub size: usize,
    pub generation: u64,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub device: Device,
    pub capacity: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
    pub fragment_count: usize,
    /// 0.0 = single contiguous free region, towards 1.0 = scattered
    pub fragmentation: f64,
    pub live_allocations: usize,
    pub high_water_mark: usize,
    pub total_allocations: u64,
    pub failed_allocations: u64,
}

impl PoolStats {
    /// Fraction of capacity currently reserved
    pub fn usage_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.capacity as f64
    }
}

/// Fixed-capacity arena for one device
///
/// Not internally synchronized; [`MemoryPoolManager`](super::MemoryPoolManager)
/// wraps each pool in its own mutex.
#[derive(Debug)]
pub struct DevicePool {
    device: Device,
    capacity: usize,
    alignment: usize,
    /// Free regions, sorted by offset, never adjacent to each other
    free_regions: Vec<FreeRegion>,
    /// Live allocations keyed by usable offset
    allocations: HashMap<usize, Allocation>,
    /// Backing storage, grown on demand up to `capacity`
    buffer: Vec<u8>,
    used: usize,
    high_water: usize,
    next_generation: u64,
    total_allocations: u64,
    failed_allocations: u64,
}

impl DevicePool {
    /// Default alignment for tensor data
    pub const DEFAULT_ALIGNMENT: usize = 256;

    /// Slack below this size is folded into the allocation instead of tracked
    pub const MIN_FRAGMENT_SIZE: usize = 64;

    /// Create a pool with the given capacity and alignment
    ///
    /// # Errors
    /// - capacity is zero
    /// - alignment is not a power of two
    pub fn new(device: Device, capacity: usize, alignment: usize) -> ForgeResult<Self> {
        if capacity == 0 {
            return Err(MemForgeError::InvalidConfiguration(format!(
                "pool capacity for {} cannot be zero",
                device
            )));
        }
        if !alignment.is_power_of_two() {
            return Err(MemForgeError::InvalidConfiguration(format!(
                "pool alignment must be a power of 2, got {}",
                alignment
            )));
        }

        tracing::info!(
            device = %device,
            capacity_mb = capacity / 1024 / 1024,
            capacity,
            "DevicePool created"
        );

        Ok(Self {
            device,
            capacity,
            alignment,
            free_regions: vec![FreeRegion::new(0, capacity)],
            allocations: HashMap::new(),
            buffer: Vec::new(),
            used: 0,
            high_water: 0,
            next_generation: 1,
            total_allocations: 0,
            failed_allocations: 0,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes reserved by live allocations
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Bytes in free regions
    pub fn free_bytes(&self) -> usize {
        self.free_regions.iter().map(|r| r.size).sum()
    }

    /// Bytes of backing storage materialized so far
    pub fn materialized_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Allocate `size` bytes
    ///
    /// # Errors
    /// - `InvalidAllocation` if size is zero
    /// - `OutOfMemory` if no free region can hold the aligned request
    pub fn allocate(&mut self, size: usize) -> ForgeResult<PoolAllocation> {
        if size == 0 {
            return Err(MemForgeError::InvalidAllocation(
                "allocation size cannot be zero".to_string(),
            ));
        }

        let best_idx = match self.find_best_fit(size) {
            Some(idx) => idx,
            None => {
                self.failed_allocations += 1;
                return Err(MemForgeError::OutOfMemory {
                    device: self.device,
                    requested: size,
                    free: self.free_bytes(),
                    largest_free: self.largest_free(),
                });
            }
        };

        let region = self.free_regions.remove(best_idx);
        let offset = Self::align_up(region.offset, self.alignment);
        let padding = offset - region.offset;
        let remaining = region.size - padding - size;

        let mut region_start = region.offset;
        let mut region_end = region.end();

        // Trailing space goes back first so the insert index stays valid
        if remaining >= Self::MIN_FRAGMENT_SIZE {
            region_end = offset + size;
            self.free_regions
                .insert(best_idx, FreeRegion::new(region_end, remaining));
        }
        if padding >= Self::MIN_FRAGMENT_SIZE {
            region_start = offset;
            self.free_regions
                .insert(best_idx, FreeRegion::new(region.offset, padding));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let region_len = region_end - region_start;
        self.allocations.insert(
            offset,
            Allocation {
                region_start,
                region_len,
                size,
                generation,
            },
        );

        self.used += region_len;
        self.high_water = self.high_water.max(self.used);
        self.total_allocations += 1;

        // Extend backing storage; capacity is the hard ceiling
        if self.buffer.len() < offset + size {
            self.buffer.resize(offset + size, 0);
        }

        tracing::trace!(
            device = %self.device,
            size,
            offset,
            reserved = region_len,
            generation,
            "pool allocated"
        );

        Ok(PoolAllocation {
            offset,
            size,
            generation,
        })
    }

    /// Return an allocation to the free list
    ///
    /// Merges the freed region with adjacent free neighbours.
    ///
    /// # Errors
    /// - `InvalidBlock` if no live allocation matches offset and generation
    pub fn release(&mut self, offset: usize, generation: u64) -> ForgeResult<usize> {
        let alloc = self.lookup(offset, generation)?;
        self.allocations.remove(&offset);
        self.used -= alloc.region_len;

        self.insert_free(FreeRegion::new(alloc.region_start, alloc.region_len));

        tracing::trace!(
            device = %self.device,
            offset,
            released = alloc.region_len,
            "pool released"
        );

        Ok(alloc.region_len)
    }

    /// Copy `data` into an allocation
    pub fn write(&mut self, offset: usize, generation: u64, data: &[u8]) -> ForgeResult<()> {
        let alloc = self.lookup(offset, generation)?;
        if data.len() > alloc.size {
            return Err(MemForgeError::InvalidAllocation(format!(
                "write of {} bytes overflows block of {} bytes",
                data.len(),
                alloc.size
            )));
        }
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy an allocation's contents out
    pub fn read(&self, offset: usize, generation: u64) -> ForgeResult<Vec<u8>> {
        let alloc = self.lookup(offset, generation)?;
        Ok(self.buffer[offset..offset + alloc.size].to_vec())
    }

    /// Whether a live allocation matches offset and generation
    pub fn is_live(&self, offset: usize, generation: u64) -> bool {
        self.lookup(offset, generation).is_ok()
    }

    /// Merge adjacent free regions
    ///
    /// Returns the number of merges performed. Release already merges
    /// eagerly, so this is a consistency pass run by periodic cleanup.
    pub fn coalesce(&mut self) -> usize {
        self.free_regions.sort_by_key(|r| r.offset);

        let mut merges = 0;
        let mut i = 0;
        while i + 1 < self.free_regions.len() {
            let current = self.free_regions[i];
            let next = self.free_regions[i + 1];

            if current.is_adjacent_to(&next) {
                self.free_regions[i].size += next.size;
                self.free_regions.remove(i + 1);
                merges += 1;
            } else {
                i += 1;
            }
        }
        merges
    }

    /// Size of the largest free region
    pub fn largest_free(&self) -> usize {
        self.free_regions.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// Number of free regions
    pub fn fragment_count(&self) -> usize {
        self.free_regions.len()
    }

    /// Calculate fragmentation ratio (0.0 = none, 1.0 = fully fragmented)
    pub fn fragmentation(&self) -> f64 {
        let free = self.free_bytes();
        if free == 0 {
            return 0.0;
        }
        1.0 - (self.largest_free() as f64 / free as f64)
    }

    pub fn stats(&self) -> PoolStats {
        let free_bytes = self.free_bytes();
        PoolStats {
            device: self.device,
            capacity: self.capacity,
            used_bytes: self.used,
            free_bytes,
            largest_free: self.largest_free(),
            fragment_count: self.fragment_count(),
            fragmentation: self.fragmentation(),
            live_allocations: self.allocations.len(),
            high_water_mark: self.high_water,
            total_allocations: self.total_allocations,
            failed_allocations: self.failed_allocations,
        }
    }

    fn lookup(&self, offset: usize, generation: u64) -> ForgeResult<Allocation> {
        match self.allocations.get(&offset) {
            Some(alloc) if alloc.generation == generation => Ok(*alloc),
            Some(alloc) => Err(MemForgeError::InvalidBlock(format!(
                "stale block on {} at offset {}: generation {} (live generation {})",
                self.device, offset, generation, alloc.generation
            ))),
            None => Err(MemForgeError::InvalidBlock(format!(
                "no live allocation on {} at offset {} (double free?)",
                self.device, offset
            ))),
        }
    }

    /// Insert a free region in offset order and merge it with its neighbours
    fn insert_free(&mut self, region: FreeRegion) {
        let idx = self
            .free_regions
            .partition_point(|r| r.offset < region.offset);
        self.free_regions.insert(idx, region);

        // Merge with the following region
        if idx + 1 < self.free_regions.len()
            && self.free_regions[idx].is_adjacent_to(&self.free_regions[idx + 1])
        {
            let next = self.free_regions.remove(idx + 1);
            self.free_regions[idx].size += next.size;
        }

        // Merge with the preceding region
        if idx > 0 && self.free_regions[idx - 1].is_adjacent_to(&self.free_regions[idx]) {
            let current = self.free_regions.remove(idx);
            self.free_regions[idx - 1].size += current.size;
        }
    }

    /// Find best-fit free region for allocation
    ///
    /// Best-fit: smallest region that can satisfy the aligned request.
    fn find_best_fit(&self, size: usize) -> Option<usize> {
        self.free_regions
            .iter()
            .enumerate()
            .filter_map(|(idx, region)| {
                let aligned_offset = Self::align_up(region.offset, self.alignment);
                if aligned_offset >= region.end() {
                    return None;
                }
                let usable = region.end() - aligned_offset;
                if usable >= size {
                    Some((idx, usable))
                } else {
                    None
                }
            })
            .min_by_key(|&(_, usable)| usable)
            .map(|(idx, _)| idx)
    }

    /// Align offset up to alignment (power of 2)
    fn align_up(offset: usize, alignment: usize) -> usize {
        (offset + alignment - 1) & !(alignment - 1)
    }
}
