//! Model weight cache
//!
//! Layers are keyed by (model, layer) and stored in pool blocks on the
//! model's current device. Recency is an intrusive list over a slab so that
//! lookups, touches and evictions are O(1); pinned entries are skipped by
//! every eviction scan.

pub mod codec;
mod lru;
pub mod types;
pub mod weight_cache;

pub use codec::{IdentityCodec, WeightCodec};
pub use types::{
    CacheConfig, CacheKey, CacheStats, EvictionOutcome, MigrationControl, MigrationReport,
};
pub use weight_cache::ModelWeightCache;
