//! Buffer-health monitor error types

use thiserror::Error;

/// Errors from constructing or reconfiguring a monitor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    /// Target occupancy outside the open interval (0, 1)
    #[error("Target buffer level {0} must lie strictly between 0 and 1")]
    TargetOutOfRange(f32),

    /// Thresholds must satisfy 0 <= critical < warning < target
    #[error("Thresholds out of order: critical={critical}, warning={warning}, target={target}")]
    ThresholdOrder {
        critical: f32,
        warning: f32,
        target: f32,
    },

    /// A sample-count or capacity setting was zero or out of range
    #[error("Invalid {name}: {value}")]
    InvalidCount { name: &'static str, value: usize },

    /// Frame ladder must satisfy 0 < min <= initial <= max
    #[error("Invalid buffer frame ladder: min={min}, initial={initial}, max={max}")]
    InvalidFrameLadder { min: u32, initial: u32, max: u32 },

    /// Sample rates must be non-zero
    #[error("Invalid sample rate: {0}Hz")]
    InvalidSampleRate(u32),

    /// A float parameter outside its allowed range
    #[error("Invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    /// The reclamation thread could not be started
    #[error("Failed to start reclaimer thread: {0}")]
    ReclaimerSpawn(String),
}

/// Result type for monitor setup operations
pub type MonitorResult<T> = Result<T, MonitorError>;
