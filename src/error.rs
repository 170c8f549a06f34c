//! Unified error handling for memforge
//!
//! A single error type covers every component of the subsystem. Errors are
//! categorised so callers can decide what to do with them:
//! - User errors (bad configuration or arguments)
//! - Capacity errors (pool or cache full, retry after freeing memory)
//! - Migration errors (offload/restore failed, model stays where it was)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;

use crate::device::Device;

/// Unified error type for memforge
#[derive(Debug, thiserror::Error)]
pub enum MemForgeError {
    // ========== Pool Errors ==========
    /// No free region on the device pool can hold the request
    #[error(
        "out of memory on {device}: requested {requested} bytes, {free} free (largest region {largest_free})"
    )]
    OutOfMemory {
        device: Device,
        requested: usize,
        free: usize,
        largest_free: usize,
    },

    /// Block was already freed, is stale, or came from another manager
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// Allocation request itself is malformed (zero size, bad alignment)
    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),

    /// No pool is configured for the device
    #[error("unknown device: {0}")]
    UnknownDevice(Device),

    // ========== Cache Errors ==========
    /// A single entry is larger than the whole cache
    #[error("cache entry too large: {size} bytes exceeds cache capacity of {capacity} bytes")]
    CacheEntryTooLarge { size: usize, capacity: usize },

    /// Pinned entries prevent making room for an insert
    #[error("cache exhausted: need {needed} bytes, only {evictable} bytes are evictable")]
    CacheExhausted { needed: usize, evictable: usize },

    // ========== Offload Errors ==========
    /// Model is not tracked by the offloader or has no cache entries
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Migration could not complete; the model stays in its last good state
    #[error("offload failure for model '{model}': {reason}")]
    OffloadFailure { model: String, reason: String },

    /// Migration aborted because an inference request arrived
    #[error("offload of model '{0}' cancelled by an in-flight request")]
    OffloadCancelled(String),

    /// Migration exceeded its deadline and was rolled back
    #[error("migration of model '{model}' timed out after {elapsed_ms} ms")]
    MigrationTimeout { model: String, elapsed_ms: u64 },

    /// Requested state transition is not legal from the current state
    #[error("invalid state transition for model '{model}': {from} -> {to}")]
    InvalidStateTransition {
        model: String,
        from: String,
        to: String,
    },

    // ========== Configuration Errors ==========
    /// Configuration values violate a constraint
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration could not be parsed
    #[error("configuration parse error: {0}")]
    Config(#[from] serde_json::Error),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Internal Errors ==========
    /// Lock poisoned (a thread panicked while holding it)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    Internal(String),
}

impl MemForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            MemForgeError::InvalidAllocation(_)
            | MemForgeError::UnknownDevice(_)
            | MemForgeError::UnknownModel(_)
            | MemForgeError::InvalidConfiguration(_)
            | MemForgeError::Config(_)
            | MemForgeError::Io(_) => ErrorCategory::User,

            MemForgeError::OutOfMemory { .. }
            | MemForgeError::CacheEntryTooLarge { .. }
            | MemForgeError::CacheExhausted { .. } => ErrorCategory::Capacity,

            MemForgeError::OffloadFailure { .. }
            | MemForgeError::OffloadCancelled(_)
            | MemForgeError::MigrationTimeout { .. }
            | MemForgeError::InvalidStateTransition { .. } => ErrorCategory::Migration,

            MemForgeError::InvalidBlock(_)
            | MemForgeError::LockPoisoned(_)
            | MemForgeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether retrying after freeing memory elsewhere can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Capacity | ErrorCategory::Migration
        )
    }

    /// Whether the caller passed bad input
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Whether the error indicates a bug
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Pool or cache is full
    Capacity,
    /// Offload or restore did not complete
    Migration,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Capacity => write!(f, "Capacity"),
            ErrorCategory::Migration => write!(f, "Migration"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for MemForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MemForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, MemForgeError>;

/// Create an invalid-configuration error with context
///
/// # Examples
/// ```ignore
/// return Err(config_error!("warning threshold {} must be below critical", w));
/// ```
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::MemForgeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MemForgeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::MemForgeError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MemForgeError::Internal(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-block error with context
#[macro_export]
macro_rules! invalid_block {
    ($msg:expr) => {
        $crate::error::MemForgeError::InvalidBlock($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MemForgeError::InvalidBlock(format!($fmt, $($arg)*))
    };
}
