//! Memory pressure levels and hysteresis

use std::fmt;

use serde::Serialize;

/// Qualitative memory pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl MemoryPressure {
    /// Numeric form for gauges
    pub fn as_i64(&self) -> i64 {
        match self {
            MemoryPressure::Normal => 0,
            MemoryPressure::Warning => 1,
            MemoryPressure::Critical => 2,
        }
    }
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryPressure::Normal => write!(f, "normal"),
            MemoryPressure::Warning => write!(f, "warning"),
            MemoryPressure::Critical => write!(f, "critical"),
        }
    }
}

/// Usage-ratio thresholds with a downgrade margin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub warning: f64,
    pub critical: f64,
    /// A level is only left once usage drops this far below its threshold
    pub hysteresis_margin: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.9,
            hysteresis_margin: 0.1,
        }
    }
}

impl PressureThresholds {
    /// Level for a ratio with no history
    pub fn classify(&self, ratio: f64) -> MemoryPressure {
        Self::classify_with(ratio, self.warning, self.critical)
    }

    /// Level after observing `ratio` while at `current`
    ///
    /// Upgrades take effect immediately. Downgrades use thresholds lowered by
    /// the margin, so Critical is held until usage falls below
    /// `critical - margin`, and Normal is only reached below
    /// `warning - margin`.
    pub fn next_level(&self, current: MemoryPressure, ratio: f64) -> MemoryPressure {
        let raw = self.classify(ratio);
        if raw >= current {
            return raw;
        }

        let sticky = Self::classify_with(
            ratio,
            self.warning - self.hysteresis_margin,
            self.critical - self.hysteresis_margin,
        );
        sticky.min(current)
    }

    fn classify_with(ratio: f64, warning: f64, critical: f64) -> MemoryPressure {
        if ratio >= critical {
            MemoryPressure::Critical
        } else if ratio >= warning {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }
}
