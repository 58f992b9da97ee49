//! Dropout-prevention configuration

use serde::{Deserialize, Serialize};

use super::error::{MonitorError, MonitorResult};
use crate::resample::InterpolationMethod;
use crate::types::SAMPLE_RATE;

/// Upper bound on the rolling history length
pub const MAX_HISTORY_CAPACITY: usize = 65_536;

/// Largest accepted drift-correction deviation (10%)
pub const MAX_RATE_DEVIATION: f64 = 0.1;

/// How the monitor reacts to rising risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreventionStrategy {
    /// Keep the buffer size; only shed processing when critical
    Fixed,
    /// Resize the buffer and correct drift as risk changes
    #[default]
    Adaptive,
    /// Adaptive, plus act on predicted dropouts before they happen
    Predictive,
}

impl PreventionStrategy {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Fixed => "Fixed",
            Self::Adaptive => "Adaptive",
            Self::Predictive => "Predictive",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Fixed => 0,
            Self::Adaptive => 1,
            Self::Predictive => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Fixed,
            2 => Self::Predictive,
            _ => Self::Adaptive,
        }
    }
}

/// Trend model fitted over the rolling history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendModel {
    /// Least-squares line through the fill ratio
    #[default]
    Linear,
    /// Least-squares line through ln(fill), i.e. exponential decay
    Exponential,
}

/// Scheduling hint for the thread driving the monitor. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadPriority {
    Normal,
    High,
    #[default]
    Realtime,
}

/// Configuration for a [`BufferHealthMonitor`](super::BufferHealthMonitor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreventionConfig {
    pub strategy: PreventionStrategy,

    /// Desired occupancy ratio, strictly between 0 and 1.
    /// Sustained fill at or above it steps the risk level down.
    pub target_buffer_level: f32,

    /// Low-water mark: sustained fill below it raises `Warning`
    pub warning_level: f32,

    /// Hard floor: sustained fill below it raises `Critical`
    pub critical_level: f32,

    /// Consecutive samples below `warning_level` before `Warning`
    pub warning_samples: u16,

    /// Consecutive samples below `critical_level` before `Critical`
    pub critical_samples: u16,

    /// Consecutive samples at or above target per one-level step down
    pub recovery_samples: u16,

    pub thread_priority: ThreadPriority,

    pub enable_prediction: bool,

    /// Samples kept in the rolling history
    pub history_capacity: usize,

    /// Samples needed before prediction kicks in
    pub min_prediction_history: usize,

    /// Most recent samples the trend is fitted over
    pub prediction_window: usize,

    pub trend_model: TrendModel,

    /// A dropout predicted within this horizon counts with probability
    /// `1 - time_to_dropout / horizon`
    pub prediction_horizon_ms: f32,

    /// Probability at which a prediction is acted on, in `(0, 1]`
    pub prediction_threshold: f32,

    /// Buffer size ladder used by adaptive strategies (frames)
    pub min_buffer_frames: u32,
    pub initial_buffer_frames: u32,
    pub max_buffer_frames: u32,

    pub input_sample_rate: u32,
    pub output_sample_rate: u32,

    pub interpolation: InterpolationMethod,

    /// Largest relative rate change applied for drift correction
    pub max_rate_deviation: f64,

    /// Consecutive exact zeros after signal treated as a dropout gap
    pub silence_run_samples: usize,

    /// Healthy samples before an adaptive strategy halves the buffer
    pub shrink_after_samples: u32,
}

impl Default for PreventionConfig {
    fn default() -> Self {
        Self {
            strategy: PreventionStrategy::default(),
            target_buffer_level: 0.5,
            warning_level: 0.25,
            critical_level: 0.1,
            warning_samples: 3,
            critical_samples: 3,
            recovery_samples: 8,
            thread_priority: ThreadPriority::default(),
            enable_prediction: true,
            history_capacity: 256,
            min_prediction_history: 8,
            prediction_window: 32,
            trend_model: TrendModel::default(),
            prediction_horizon_ms: 50.0,
            prediction_threshold: 0.5,
            min_buffer_frames: 64,
            initial_buffer_frames: 512,
            max_buffer_frames: 4096,
            input_sample_rate: SAMPLE_RATE,
            output_sample_rate: SAMPLE_RATE,
            interpolation: InterpolationMethod::default(),
            max_rate_deviation: 0.005,
            silence_run_samples: 64,
            shrink_after_samples: 512,
        }
    }
}

impl PreventionConfig {
    /// Config with the given strategy and defaults elsewhere
    pub fn with_strategy(strategy: PreventionStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Nominal conversion ratio (`output_rate / input_rate`)
    pub fn base_ratio(&self) -> f64 {
        self.output_sample_rate as f64 / self.input_sample_rate.max(1) as f64
    }

    /// Check every invariant; the monitor refuses configs that fail this
    pub fn validate(&self) -> MonitorResult<()> {
        validate_thresholds(self.critical_level, self.warning_level, self.target_buffer_level)?;

        for (name, value) in [
            ("warning_samples", self.warning_samples as usize),
            ("critical_samples", self.critical_samples as usize),
            ("recovery_samples", self.recovery_samples as usize),
            ("silence_run_samples", self.silence_run_samples),
            ("shrink_after_samples", self.shrink_after_samples as usize),
        ] {
            if value == 0 {
                return Err(MonitorError::InvalidCount { name, value });
            }
        }

        if self.history_capacity < 2 || self.history_capacity > MAX_HISTORY_CAPACITY {
            return Err(MonitorError::InvalidCount {
                name: "history_capacity",
                value: self.history_capacity,
            });
        }
        if self.min_prediction_history < 2 || self.min_prediction_history > self.history_capacity {
            return Err(MonitorError::InvalidCount {
                name: "min_prediction_history",
                value: self.min_prediction_history,
            });
        }
        if self.prediction_window < self.min_prediction_history
            || self.prediction_window > self.history_capacity
        {
            return Err(MonitorError::InvalidCount {
                name: "prediction_window",
                value: self.prediction_window,
            });
        }

        if !(self.prediction_horizon_ms.is_finite() && self.prediction_horizon_ms > 0.0) {
            return Err(MonitorError::InvalidParameter {
                name: "prediction_horizon_ms",
                value: self.prediction_horizon_ms as f64,
            });
        }
        if !(self.prediction_threshold > 0.0 && self.prediction_threshold <= 1.0) {
            return Err(MonitorError::InvalidParameter {
                name: "prediction_threshold",
                value: self.prediction_threshold as f64,
            });
        }
        if !(0.0..=MAX_RATE_DEVIATION).contains(&self.max_rate_deviation) {
            return Err(MonitorError::InvalidParameter {
                name: "max_rate_deviation",
                value: self.max_rate_deviation,
            });
        }

        if self.min_buffer_frames == 0
            || self.min_buffer_frames > self.initial_buffer_frames
            || self.initial_buffer_frames > self.max_buffer_frames
        {
            return Err(MonitorError::InvalidFrameLadder {
                min: self.min_buffer_frames,
                initial: self.initial_buffer_frames,
                max: self.max_buffer_frames,
            });
        }

        for rate in [self.input_sample_rate, self.output_sample_rate] {
            if rate == 0 {
                return Err(MonitorError::InvalidSampleRate(rate));
            }
        }

        Ok(())
    }
}

/// `0 <= critical < warning < target < 1`
pub(crate) fn validate_thresholds(critical: f32, warning: f32, target: f32) -> MonitorResult<()> {
    if !(target > 0.0 && target < 1.0) {
        return Err(MonitorError::TargetOutOfRange(target));
    }
    if !(critical >= 0.0 && critical < warning && warning < target) {
        return Err(MonitorError::ThresholdOrder {
            critical,
            warning,
            target,
        });
    }
    Ok(())
}
