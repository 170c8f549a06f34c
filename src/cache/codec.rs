//! Payload codec extension point
//!
//! The cache stores whatever the codec produces. No compression scheme ships
//! with the crate; callers that want one provide their own [`WeightCodec`].

use std::fmt::Debug;

use crate::error::ForgeResult;

/// Transform applied to weights on `put` and reversed on `get`
pub trait WeightCodec: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn encode(&self, raw: &[u8]) -> ForgeResult<Vec<u8>>;

    fn decode(&self, stored: &[u8]) -> ForgeResult<Vec<u8>>;
}

/// Stores payloads unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl WeightCodec for IdentityCodec {
    fn name(&self) -> &str {
        "identity"
    }

    fn encode(&self, raw: &[u8]) -> ForgeResult<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decode(&self, stored: &[u8]) -> ForgeResult<Vec<u8>> {
        Ok(stored.to_vec())
    }
}
