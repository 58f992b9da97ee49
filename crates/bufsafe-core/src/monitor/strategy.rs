//! Buffering recommendations
//!
//! Turns the current classification (and prediction) into an action for the
//! pipeline. The mutable part, buffer frames plus a healthy-sample run, is
//! packed into one `u64` so the monitor can advance it with one CAS.

use serde::Serialize;

use super::classify::DropoutLevel;
use super::config::{PreventionConfig, PreventionStrategy};

/// What the pipeline should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Keep going as is
    #[default]
    Maintain,
    /// Switch to the larger `buffer_frames`
    GrowBuffer,
    /// Switch to the smaller `buffer_frames`
    ShrinkBuffer,
    /// Resample at `conversion_ratio` to pull the fill back toward target
    EngageRateConversion,
    /// Skip optional processing to catch up
    ReduceProcessing,
}

/// Result of every `update_buffer_metrics` call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Recommendation {
    pub level: DropoutLevel,
    pub action: RecommendedAction,
    /// Buffer size the pipeline should run with (frames)
    pub buffer_frames: u32,
    /// `output_rate / input_rate` to convert at, drift correction included
    pub conversion_ratio: f64,
}

/// Fixed parameters of the recommendation logic
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StrategyParams {
    pub min_frames: u32,
    pub initial_frames: u32,
    pub max_frames: u32,
    pub shrink_after: u32,
    pub base_ratio: f64,
    pub max_rate_deviation: f64,
}

impl StrategyParams {
    pub(crate) fn from_config(config: &PreventionConfig) -> Self {
        Self {
            min_frames: config.min_buffer_frames,
            initial_frames: config.initial_buffer_frames,
            max_frames: config.max_buffer_frames,
            shrink_after: config.shrink_after_samples,
            base_ratio: config.base_ratio(),
            max_rate_deviation: config.max_rate_deviation,
        }
    }

    /// Ratio that nudges the fill back toward `target`
    pub(crate) fn drift_ratio(&self, fill: f32, target: f32) -> f64 {
        let error = ((target - fill) / target).clamp(-1.0, 1.0) as f64;
        self.base_ratio * (1.0 + error * self.max_rate_deviation)
    }
}

/// Per-sample inputs
#[derive(Debug, Clone, Copy)]
pub(crate) struct StrategyInput {
    pub strategy: PreventionStrategy,
    pub previous: DropoutLevel,
    pub level: DropoutLevel,
    pub fill: f32,
    pub target: f32,
    /// Prediction at or above threshold on this sample
    pub predicted: bool,
    /// ... and not on the previous one
    pub prediction_edge: bool,
}

/// Packed `(buffer_frames, healthy_run)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StrategyState {
    pub frames: u32,
    pub healthy_run: u32,
}

impl StrategyState {
    #[inline]
    pub(crate) fn pack(self) -> u64 {
        (self.frames as u64) | (self.healthy_run as u64) << 32
    }

    #[inline]
    pub(crate) fn unpack(bits: u64) -> Self {
        Self {
            frames: bits as u32,
            healthy_run: (bits >> 32) as u32,
        }
    }

    /// Advance by one sample, returning the new state and the recommendation
    pub(crate) fn step(self, input: &StrategyInput, params: &StrategyParams) -> (Self, Recommendation) {
        let mut frames = self.frames;
        let mut ratio = params.base_ratio;
        let critical = input.level >= DropoutLevel::Critical;
        let escalated = input.level > input.previous;

        if input.strategy == PreventionStrategy::Fixed {
            let action = if critical {
                RecommendedAction::ReduceProcessing
            } else {
                RecommendedAction::Maintain
            };
            let state = Self {
                frames: params.initial_frames,
                healthy_run: 0,
            };
            return (state, recommend(input.level, action, state.frames, ratio));
        }

        let predictive = input.strategy == PreventionStrategy::Predictive;
        let healthy = input.level == DropoutLevel::None
            && input.fill >= input.target
            && !(predictive && input.predicted);
        let mut healthy_run = if healthy {
            self.healthy_run.saturating_add(1)
        } else {
            0
        };

        let action = if critical {
            if escalated && frames < params.max_frames {
                frames = frames.saturating_mul(2).min(params.max_frames);
                RecommendedAction::GrowBuffer
            } else {
                RecommendedAction::ReduceProcessing
            }
        } else if predictive && input.prediction_edge && frames < params.max_frames {
            frames = frames.saturating_mul(2).min(params.max_frames);
            RecommendedAction::GrowBuffer
        } else if input.level == DropoutLevel::Warning || (predictive && input.predicted) {
            ratio = params.drift_ratio(input.fill, input.target);
            RecommendedAction::EngageRateConversion
        } else if healthy_run >= params.shrink_after && frames > params.min_frames {
            frames = (frames / 2).max(params.min_frames);
            healthy_run = 0;
            RecommendedAction::ShrinkBuffer
        } else {
            RecommendedAction::Maintain
        };

        let state = Self {
            frames,
            healthy_run,
        };
        (state, recommend(input.level, action, frames, ratio))
    }
}

fn recommend(
    level: DropoutLevel,
    action: RecommendedAction,
    buffer_frames: u32,
    conversion_ratio: f64,
) -> Recommendation {
    Recommendation {
        level,
        action,
        buffer_frames,
        conversion_ratio,
    }
}
