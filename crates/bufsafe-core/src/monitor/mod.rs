//! Dropout prevention and buffer-health monitoring
//!
//! [`BufferHealthMonitor`] receives one occupancy report per audio callback,
//! keeps a rolling history, classifies dropout risk with hysteresis,
//! optionally extrapolates a trend to predict the next dropout, and answers
//! every report with a [`Recommendation`] for the pipeline.
//!
//! # Real-time Safety
//!
//! Every per-callback method (`update_buffer_metrics`, `record_sample`,
//! `report_underrun`, `detect_dropout`, `process_sample_rate_conversion`)
//! works on atomics only: no locks, no allocation, no logging. Listener
//! registration and the constructor allocate and belong on a setup thread.
//!
//! ```text
//! update_buffer_metrics ─► RollingHistory ─► classifier (CAS) ─► predictor
//!                                                 │                  │
//!                                                 ▼                  ▼
//!                                       strategy (CAS) ─► Recommendation
//!                                                 │
//!                                                 ▼
//!                                     listeners (SharedCell snapshot)
//! ```

mod classify;
mod config;
mod convert;
mod error;
mod history;
mod listener;
mod predict;
mod strategy;

pub use classify::{ClassifierState, DropoutEvent, DropoutLevel, Thresholds};
pub use config::{
    PreventionConfig, PreventionStrategy, ThreadPriority, TrendModel, MAX_HISTORY_CAPACITY,
    MAX_RATE_DEVIATION,
};
pub use error::{MonitorError, MonitorResult};
pub use history::{BufferMetricsSample, RollingHistory};
pub use listener::{DropoutListener, ListenerId};
pub use predict::{predict, Prediction, PredictionParams};
pub use strategy::{Recommendation, RecommendedAction};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;

use crate::gc::Reclaimer;
use crate::resample::{convert_block, ConversionReport, RateConverter};
use convert::ConverterSlot;
use crate::types::Sample;
use listener::ListenerRegistry;
use strategy::{StrategyInput, StrategyParams, StrategyState};

/// Fill change that triggers `buffer_level_changed`
pub const LEVEL_CHANGE_EPSILON: f32 = 0.05;

/// Point-in-time view of the monitor
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferMetrics {
    /// Most recent sample, if any was recorded
    pub latest: Option<BufferMetricsSample>,
    pub level: DropoutLevel,
    pub strategy: PreventionStrategy,
    pub target_buffer_level: f32,
    pub samples_recorded: u64,
    /// Underruns reported by the pipeline
    pub underruns: u64,
    /// Gaps or invalid samples found by `detect_dropout`
    pub content_dropouts: u64,
    pub buffer_frames: u32,
    pub conversion_ratio: f64,
    pub prediction: Option<Prediction>,
}

impl BufferMetrics {
    pub fn fill_ratio(&self) -> f32 {
        self.latest.map_or(0.0, |s| s.fill_ratio)
    }
}

/// Observes buffer occupancy and recommends how to avoid dropouts
///
/// `&self` everywhere: share it by reference or `Arc` between the audio
/// thread and control threads.
pub struct BufferHealthMonitor {
    config: PreventionConfig,
    params: StrategyParams,
    started: Instant,

    history: RollingHistory,
    classifier: CachePadded<AtomicU64>,
    strategy_state: AtomicU64,

    strategy: AtomicU8,
    target_bits: AtomicU32,
    prediction_enabled: AtomicBool,

    action: AtomicU8,
    ratio_bits: AtomicU64,

    /// NaN while no prediction is available
    probability_bits: AtomicU32,
    ttd_bits: AtomicU32,
    slope_bits: AtomicU32,
    predicted: AtomicBool,

    last_notified_fill: AtomicU32,
    underruns: AtomicU64,
    content_dropouts: AtomicU64,

    converter: ConverterSlot,

    // Declared before the reclaimer so retired lists reach its final pass
    listeners: ListenerRegistry,
    reclaimer: Reclaimer,
}

impl BufferHealthMonitor {
    /// Validate `config` and start the listener reclaimer thread.
    /// **NOT real-time safe.**
    pub fn new(config: PreventionConfig) -> MonitorResult<Self> {
        config.validate()?;

        let reclaimer = Reclaimer::spawn("bufsafe-reclaim")
            .map_err(|e| MonitorError::ReclaimerSpawn(e.to_string()))?;
        let params = StrategyParams::from_config(&config);
        let initial_state = StrategyState {
            frames: config.initial_buffer_frames,
            healthy_run: 0,
        };

        log::info!(
            "Buffer health monitor started: strategy={}, target={:.2}, warning={:.2}, critical={:.2}, prediction={}",
            config.strategy.display_name(),
            config.target_buffer_level,
            config.warning_level,
            config.critical_level,
            config.enable_prediction,
        );

        Ok(Self {
            params,
            started: Instant::now(),
            history: RollingHistory::new(config.history_capacity),
            classifier: CachePadded::new(AtomicU64::new(ClassifierState::default().pack())),
            strategy_state: AtomicU64::new(initial_state.pack()),
            strategy: AtomicU8::new(config.strategy.to_u8()),
            target_bits: AtomicU32::new(config.target_buffer_level.to_bits()),
            prediction_enabled: AtomicBool::new(config.enable_prediction),
            action: AtomicU8::new(action_to_u8(RecommendedAction::Maintain)),
            ratio_bits: AtomicU64::new(params.base_ratio.to_bits()),
            probability_bits: AtomicU32::new(f32::NAN.to_bits()),
            ttd_bits: AtomicU32::new(f32::NAN.to_bits()),
            slope_bits: AtomicU32::new(f32::NAN.to_bits()),
            predicted: AtomicBool::new(false),
            last_notified_fill: AtomicU32::new(f32::NAN.to_bits()),
            underruns: AtomicU64::new(0),
            content_dropouts: AtomicU64::new(0),
            converter: ConverterSlot::new(RateConverter::new(params.base_ratio, config.interpolation)),
            listeners: ListenerRegistry::new(reclaimer.handle()),
            reclaimer,
            config,
        })
    }

    /// Configuration as constructed (setters are not reflected here)
    pub fn config(&self) -> &PreventionConfig {
        &self.config
    }

    /// Advisory scheduling hint for the thread driving the monitor
    pub fn thread_priority(&self) -> ThreadPriority {
        self.config.thread_priority
    }

    // ─────────────────────────────────────────────────────────────────────
    // Real-time path
    // ─────────────────────────────────────────────────────────────────────

    /// Report the buffer state for this callback
    ///
    /// `available < requested` counts as an actual underrun.
    #[inline]
    pub fn update_buffer_metrics(&self, requested: u32, available: u32, capacity: u32) -> Recommendation {
        let sample = BufferMetricsSample::new(requested, available, capacity, self.now_us());
        self.record_sample(sample)
    }

    /// Report a sample with a caller-supplied timestamp
    pub fn record_sample(&self, sample: BufferMetricsSample) -> Recommendation {
        self.history.record(sample);

        let thresholds = self.thresholds();
        let underrun = sample.is_underrun();
        if underrun {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }

        let (previous, current) =
            self.advance_classifier(|state| state.step(sample.fill_ratio, underrun, &thresholds));

        let (predicted, prediction_edge) = self.update_prediction();

        let input = StrategyInput {
            strategy: self.strategy(),
            previous: previous.level,
            level: current.level,
            fill: sample.fill_ratio,
            target: thresholds.target,
            predicted,
            prediction_edge,
        };
        let recommendation = self.advance_strategy(&input);

        if current.level != previous.level {
            let event = DropoutEvent {
                level: current.level,
                previous: previous.level,
                timestamp_us: sample.timestamp_us,
                sample,
            };
            self.listeners.for_each(|l| l.dropout_detected(&event));
        }
        if prediction_edge {
            if let Some(Prediction {
                probability,
                time_to_dropout_secs: Some(ttd),
                ..
            }) = self.prediction()
            {
                self.listeners
                    .for_each(|l| l.dropout_predicted(probability, ttd));
            }
        }
        self.notify_level_change(sample.fill_ratio);

        recommendation
    }

    /// Record an underrun the pipeline observed (an xrun callback, say)
    pub fn report_underrun(&self) -> Recommendation {
        let capacity = self.history.latest().map_or(0, |s| s.capacity);
        self.record_sample(BufferMetricsSample::new(1, 0, capacity, self.now_us()))
    }

    /// Classify the current block
    ///
    /// Non-finite samples or a run of at least `silence_run_samples` exact
    /// zeros with signal on both sides count as an occurred dropout.
    /// Otherwise the tracked level is returned, raised from `None` to
    /// `Warning` if the prediction is above threshold.
    pub fn detect_dropout(&self, channels: &[&[Sample]], sample_count: usize) -> DropoutLevel {
        let broken = channels.iter().any(|channel| {
            let len = sample_count.min(channel.len());
            has_content_dropout(&channel[..len], self.config.silence_run_samples)
        });

        if broken {
            self.content_dropouts.fetch_add(1, Ordering::Relaxed);
            let (previous, current) = self.advance_classifier(|_| ClassifierState {
                level: DropoutLevel::Occurred,
                ..ClassifierState::default()
            });
            if previous.level != current.level {
                // Stamped with the last reported sample so events share the
                // time base of whoever feeds the history
                let sample = self.history.latest().unwrap_or_default();
                let event = DropoutEvent {
                    level: current.level,
                    previous: previous.level,
                    timestamp_us: sample.timestamp_us,
                    sample,
                };
                self.listeners.for_each(|l| l.dropout_detected(&event));
            }
            return DropoutLevel::Occurred;
        }

        let level = self.level();
        if level == DropoutLevel::None
            && self.prediction_enabled.load(Ordering::Relaxed)
            && self.predicted.load(Ordering::Acquire)
        {
            return DropoutLevel::Warning;
        }
        level
    }

    /// Convert the next block of the monitored stream at the current
    /// effective ratio into `output`
    ///
    /// Consecutive calls continue one signal: phase and the previous block's
    /// tail carry over, so the total output tracks `input_total * ratio` and
    /// block edges join without clamping. Output lags the input by
    /// [`crate::resample::STREAM_LATENCY`] samples. A call that races another
    /// conversion converts its block on its own instead of waiting.
    ///
    /// Writes what fits and reports the shortfall; never allocates.
    #[inline]
    pub fn process_sample_rate_conversion(&self, input: &[Sample], output: &mut [Sample]) -> ConversionReport {
        let ratio = self.conversion_ratio();
        match self.converter.try_claim() {
            Some(mut converter) => {
                converter.set_ratio(ratio);
                converter.process(input, output)
            }
            None => convert_block(input, output, ratio, self.config.interpolation),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn level(&self) -> DropoutLevel {
        ClassifierState::unpack(self.classifier.load(Ordering::Acquire)).level
    }

    /// Effective `output_rate / input_rate`, drift correction included
    pub fn conversion_ratio(&self) -> f64 {
        f64::from_bits(self.ratio_bits.load(Ordering::Acquire))
    }

    /// The last recommendation handed out
    pub fn recommendation(&self) -> Recommendation {
        Recommendation {
            level: self.level(),
            action: action_from_u8(self.action.load(Ordering::Acquire)),
            buffer_frames: StrategyState::unpack(self.strategy_state.load(Ordering::Acquire)).frames,
            conversion_ratio: self.conversion_ratio(),
        }
    }

    /// Latest prediction; `None` during cold start or with prediction off
    pub fn prediction(&self) -> Option<Prediction> {
        let probability = f32::from_bits(self.probability_bits.load(Ordering::Acquire));
        if probability.is_nan() {
            return None;
        }
        let ttd = f32::from_bits(self.ttd_bits.load(Ordering::Acquire));
        Some(Prediction {
            probability,
            time_to_dropout_secs: (!ttd.is_nan()).then_some(ttd),
            slope_per_sec: f32::from_bits(self.slope_bits.load(Ordering::Acquire)),
        })
    }

    pub fn current_buffer_metrics(&self) -> BufferMetrics {
        BufferMetrics {
            latest: self.history.latest(),
            level: self.level(),
            strategy: self.strategy(),
            target_buffer_level: self.target_buffer_level(),
            samples_recorded: self.history.total_recorded(),
            underruns: self.underruns.load(Ordering::Relaxed),
            content_dropouts: self.content_dropouts.load(Ordering::Relaxed),
            buffer_frames: self.recommendation().buffer_frames,
            conversion_ratio: self.conversion_ratio(),
            prediction: self.prediction(),
        }
    }

    pub fn history(&self) -> &RollingHistory {
        &self.history
    }

    pub fn strategy(&self) -> PreventionStrategy {
        PreventionStrategy::from_u8(self.strategy.load(Ordering::Relaxed))
    }

    pub fn target_buffer_level(&self) -> f32 {
        f32::from_bits(self.target_bits.load(Ordering::Relaxed))
    }

    pub fn is_prediction_enabled(&self) -> bool {
        self.prediction_enabled.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control (non-real-time)
    // ─────────────────────────────────────────────────────────────────────

    /// Register a listener. **NOT real-time safe.**
    pub fn add_dropout_listener(&self, listener: Arc<dyn DropoutListener>) -> ListenerId {
        let id = self.listeners.add(listener);
        log::debug!("Dropout listener {:?} added ({} total)", id, self.listeners.len());
        id
    }

    /// Unregister a listener. **NOT real-time safe.**
    pub fn remove_dropout_listener(&self, id: ListenerId) -> bool {
        let removed = self.listeners.remove(id);
        if removed {
            self.reclaimer.collect_now();
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn set_strategy(&self, strategy: PreventionStrategy) {
        let previous = PreventionStrategy::from_u8(self.strategy.swap(strategy.to_u8(), Ordering::AcqRel));
        if previous != strategy {
            log::info!(
                "Prevention strategy: {} -> {}",
                previous.display_name(),
                strategy.display_name()
            );
        }
    }

    /// Change the target occupancy; must stay above the warning level
    pub fn set_target_buffer_level(&self, target: f32) -> MonitorResult<()> {
        config::validate_thresholds(self.config.critical_level, self.config.warning_level, target)?;
        self.target_bits.store(target.to_bits(), Ordering::Relaxed);
        log::info!("Target buffer level set to {:.2}", target);
        Ok(())
    }

    pub fn set_prediction_enabled(&self, enabled: bool) {
        self.prediction_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.clear_prediction();
        }
    }

    /// Forget history, level, counters and buffer size.
    /// Not meant to race with the real-time calls.
    pub fn reset(&self) {
        self.history.clear();
        self.classifier
            .store(ClassifierState::default().pack(), Ordering::Release);
        self.strategy_state.store(
            StrategyState {
                frames: self.params.initial_frames,
                healthy_run: 0,
            }
            .pack(),
            Ordering::Release,
        );
        self.action
            .store(action_to_u8(RecommendedAction::Maintain), Ordering::Release);
        self.ratio_bits
            .store(self.params.base_ratio.to_bits(), Ordering::Release);
        self.clear_prediction();
        self.last_notified_fill
            .store(f32::NAN.to_bits(), Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.content_dropouts.store(0, Ordering::Relaxed);
        self.converter.claim().reset();
        log::debug!("Buffer health monitor reset");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    #[inline]
    fn now_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    #[inline]
    fn thresholds(&self) -> Thresholds {
        Thresholds {
            target: self.target_buffer_level(),
            warning: self.config.warning_level,
            critical: self.config.critical_level,
            warning_samples: self.config.warning_samples,
            critical_samples: self.config.critical_samples,
            recovery_samples: self.config.recovery_samples,
        }
    }

    /// CAS the classifier forward, returning `(before, after)`
    #[inline]
    fn advance_classifier<F>(&self, mut step: F) -> (ClassifierState, ClassifierState)
    where
        F: FnMut(ClassifierState) -> ClassifierState,
    {
        let mut after = ClassifierState::default();
        let before = self
            .classifier
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                after = step(ClassifierState::unpack(bits));
                Some(after.pack())
            })
            .unwrap_or_else(|bits| bits);
        (ClassifierState::unpack(before), after)
    }

    #[inline]
    fn advance_strategy(&self, input: &StrategyInput) -> Recommendation {
        let mut recommendation = None;
        let _ = self
            .strategy_state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let (next, rec) = StrategyState::unpack(bits).step(input, &self.params);
                recommendation = Some(rec);
                Some(next.pack())
            });
        // The closure always runs at least once
        let recommendation = recommendation.unwrap_or(Recommendation {
            level: input.level,
            action: RecommendedAction::Maintain,
            buffer_frames: self.params.initial_frames,
            conversion_ratio: self.params.base_ratio,
        });

        self.action
            .store(action_to_u8(recommendation.action), Ordering::Release);
        self.ratio_bits
            .store(recommendation.conversion_ratio.to_bits(), Ordering::Release);
        recommendation
    }

    /// Refit the trend; returns `(above threshold, just crossed)`
    #[inline]
    fn update_prediction(&self) -> (bool, bool) {
        if !self.prediction_enabled.load(Ordering::Relaxed) {
            return (false, false);
        }
        let params = PredictionParams {
            model: self.config.trend_model,
            window: self.config.prediction_window,
            min_history: self.config.min_prediction_history,
            critical_level: self.config.critical_level,
            horizon_secs: self.config.prediction_horizon_ms / 1000.0,
        };
        let Some(prediction) = predict(&self.history, &params) else {
            self.clear_prediction();
            return (false, false);
        };

        self.probability_bits
            .store(prediction.probability.to_bits(), Ordering::Release);
        self.ttd_bits.store(
            prediction.time_to_dropout_secs.unwrap_or(f32::NAN).to_bits(),
            Ordering::Release,
        );
        self.slope_bits
            .store(prediction.slope_per_sec.to_bits(), Ordering::Release);

        let above = prediction.exceeds(self.config.prediction_threshold);
        let was_above = self.predicted.swap(above, Ordering::AcqRel);
        (above, above && !was_above)
    }

    fn clear_prediction(&self) {
        self.probability_bits
            .store(f32::NAN.to_bits(), Ordering::Release);
        self.ttd_bits.store(f32::NAN.to_bits(), Ordering::Release);
        self.slope_bits.store(f32::NAN.to_bits(), Ordering::Release);
        self.predicted.store(false, Ordering::Release);
    }

    #[inline]
    fn notify_level_change(&self, fill: f32) {
        let last = f32::from_bits(self.last_notified_fill.load(Ordering::Relaxed));
        if last.is_nan() || (fill - last).abs() >= LEVEL_CHANGE_EPSILON {
            self.last_notified_fill
                .store(fill.to_bits(), Ordering::Relaxed);
            self.listeners.for_each(|l| l.buffer_level_changed(fill));
        }
    }
}

/// Non-finite samples, or a long run of exact zeros between two non-zero
/// samples
fn has_content_dropout(samples: &[Sample], min_gap: usize) -> bool {
    let mut seen_signal = false;
    let mut zero_run = 0usize;
    for &sample in samples {
        if !sample.is_finite() {
            return true;
        }
        if sample == 0.0 {
            zero_run += 1;
            continue;
        }
        if seen_signal && zero_run >= min_gap {
            return true;
        }
        seen_signal = true;
        zero_run = 0;
    }
    false
}

fn action_to_u8(action: RecommendedAction) -> u8 {
    match action {
        RecommendedAction::Maintain => 0,
        RecommendedAction::GrowBuffer => 1,
        RecommendedAction::ShrinkBuffer => 2,
        RecommendedAction::EngageRateConversion => 3,
        RecommendedAction::ReduceProcessing => 4,
    }
}

fn action_from_u8(value: u8) -> RecommendedAction {
    match value {
        1 => RecommendedAction::GrowBuffer,
        2 => RecommendedAction::ShrinkBuffer,
        3 => RecommendedAction::EngageRateConversion,
        4 => RecommendedAction::ReduceProcessing,
        _ => RecommendedAction::Maintain,
    }
}
