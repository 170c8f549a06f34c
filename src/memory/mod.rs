//! Per-device memory pools
//!
//! Each configured device gets one fixed-capacity arena, subdivided with
//! best-fit free block allocation:
//! 1. Capacity is fixed at configuration time (no resize mid-run)
//! 2. Requests are served from the smallest free region that fits
//! 3. Freed regions merge with their free neighbours immediately
//! 4. A coalescing pass runs as periodic cleanup under memory pressure
//!
//! Blocks carry a generation number and the issuing manager's id so that
//! double frees and foreign blocks are rejected with `InvalidBlock`.

pub mod block;
pub mod manager;
pub mod pool;

pub use block::MemoryBlock;
pub use manager::MemoryPoolManager;
pub use pool::{DevicePool, PoolAllocation, PoolStats};
