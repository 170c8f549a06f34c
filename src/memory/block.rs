//! Allocation descriptors handed out by the pool manager

use serde::Serialize;

use crate::device::Device;

/// A contiguous allocation inside one device pool
///
/// The descriptor is only valid for the manager that issued it and only until
/// it is passed back to [`deallocate`](super::MemoryPoolManager::deallocate).
/// The generation number makes a stale descriptor detectable even when the
/// same offset has since been handed out again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MemoryBlock {
    pub(crate) device: Device,
    pub(crate) manager_id: u64,
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) generation: u64,
}

impl MemoryBlock {
    pub fn device(&self) -> Device {
        self.device
    }

    /// Byte offset of the usable region inside the device arena
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Requested size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn manager_id(&self) -> u64 {
        self.manager_id
    }
}
