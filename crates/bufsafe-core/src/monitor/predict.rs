//! Trend-based time-to-dropout prediction
//!
//! Fits a least-squares line through the most recent fill ratios (or their
//! logarithm, for the exponential model) against time, and extrapolates when
//! the fill will cross the critical floor. Accumulation is a handful of
//! running sums, so a fit never allocates.

use serde::Serialize;

use super::config::TrendModel;
use super::history::RollingHistory;

/// Floor for `ln(fill)` so an empty buffer does not produce -inf
const MIN_LOG_FILL: f64 = 1e-4;

/// Slopes flatter than this (per second) count as no trend
const FLAT_SLOPE: f64 = 1e-6;

/// Result of one prediction pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    /// 0..=1; 1 means the dropout is due now
    pub probability: f32,
    /// Seconds until the critical floor is crossed, `None` if fill is not
    /// falling
    pub time_to_dropout_secs: Option<f32>,
    /// Fitted fill change per second at the latest sample
    pub slope_per_sec: f32,
}

impl Prediction {
    /// A prediction without a crossing time never exceeds, whatever the
    /// threshold
    pub fn exceeds(&self, threshold: f32) -> bool {
        self.time_to_dropout_secs.is_some() && self.probability >= threshold
    }
}

/// Parameters for [`predict`]
#[derive(Debug, Clone, Copy)]
pub struct PredictionParams {
    pub model: TrendModel,
    pub window: usize,
    pub min_history: usize,
    pub critical_level: f32,
    pub horizon_secs: f32,
}

/// Running sums for an ordinary least-squares fit
#[derive(Debug, Default, Clone, Copy)]
struct LeastSquares {
    n: f64,
    sx: f64,
    sy: f64,
    sxx: f64,
    sxy: f64,
}

impl LeastSquares {
    #[inline]
    fn add(&mut self, x: f64, y: f64) {
        self.n += 1.0;
        self.sx += x;
        self.sy += y;
        self.sxx += x * x;
        self.sxy += x * y;
    }

    /// `(intercept, slope)`, or `None` when every x is identical
    fn solve(&self) -> Option<(f64, f64)> {
        let denom = self.n * self.sxx - self.sx * self.sx;
        if self.n < 2.0 || denom.abs() < 1e-12 {
            return None;
        }
        let slope = (self.n * self.sxy - self.sx * self.sy) / denom;
        let intercept = (self.sy - slope * self.sx) / self.n;
        Some((intercept, slope))
    }
}

/// Predict the next dropout from the history
///
/// `None` during cold start (fewer than `min_history` samples) or when the
/// samples carry no usable time spread; callers then rely on thresholds
/// alone.
pub fn predict(history: &RollingHistory, params: &PredictionParams) -> Option<Prediction> {
    if history.len() < params.min_history {
        return None;
    }
    let latest_us = history.latest()?.timestamp_us;

    let mut fit = LeastSquares::default();
    let visited = history.for_each_recent(params.window, |sample| {
        // x in seconds relative to the newest sample, so "now" is x = 0
        let x = -((latest_us.saturating_sub(sample.timestamp_us)) as f64 / 1_000_000.0);
        let fill = sample.fill_ratio as f64;
        let y = match params.model {
            TrendModel::Linear => fill,
            TrendModel::Exponential => fill.max(MIN_LOG_FILL).ln(),
        };
        fit.add(x, y);
    });
    if visited < params.min_history {
        return None;
    }
    let (intercept, slope) = fit.solve()?;

    let critical = params.critical_level as f64;
    let (now_fill, floor, slope_per_sec) = match params.model {
        TrendModel::Linear => (intercept, critical, slope),
        TrendModel::Exponential => {
            let now = intercept.exp();
            (intercept, critical.max(MIN_LOG_FILL).ln(), slope * now)
        }
    };

    let time_to_dropout = if now_fill <= floor {
        Some(0.0)
    } else if slope < -FLAT_SLOPE {
        Some((now_fill - floor) / -slope)
    } else {
        None
    };

    let probability = match time_to_dropout {
        Some(ttd) => (1.0 - ttd / params.horizon_secs as f64).clamp(0.0, 1.0),
        None => 0.0,
    };

    Some(Prediction {
        probability: probability as f32,
        time_to_dropout_secs: time_to_dropout.map(|t| t as f32),
        slope_per_sec: slope_per_sec as f32,
    })
}
