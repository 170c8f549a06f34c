//! Automatic offloading of idle models
//!
//! Under memory pressure, models that have been idle longer than the
//! eligibility window are moved from their home device to the offload
//! device (host memory by default), least recently used first. Once the home
//! device calms down they are moved back.

pub mod offloader;
pub mod state;

pub use offloader::{AutomaticOffloader, InferenceLease};
pub use state::{
    ModelState, ModelStatus, OffloadCounters, OffloadDecision, OffloaderConfig, RestoreOutcome,
    TickReport,
};
