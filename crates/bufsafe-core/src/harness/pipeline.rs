//! Simulated streaming pipeline
//!
//! A producer feeds a sine tone into an `rtrb` ring; a simulated audio
//! callback drains one block per step. Each step follows the per-callback
//! contract: report the fill to the monitor, borrow scratch blocks from the
//! pool, read the recommendation, resample if asked to, return the blocks.
//!
//! The producer jitters its delivery and stalls periodically, then pays back
//! what it missed. Everything runs on one thread with synthetic timestamps,
//! so a given seed always yields the same report.

use anyhow::{bail, Result};
use rtrb::RingBuffer;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{HarnessConfig, XorShift};
use crate::monitor::{
    BufferHealthMonitor, BufferMetricsSample, DropoutEvent, DropoutLevel, DropoutListener,
    RecommendedAction,
};
use crate::pool::BlockPool;
use crate::types::Sample;

/// Relative jitter of the producer's delivery per block
const PRODUCER_JITTER: f64 = 0.05;

/// Test tone frequency
const TONE_HZ: f64 = 440.0;

/// Times each classification was returned by `detect_dropout`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub none: u64,
    pub warning: u64,
    pub critical: u64,
    pub occurred: u64,
}

impl LevelCounts {
    fn count(&mut self, level: DropoutLevel) {
        match level {
            DropoutLevel::None => self.none += 1,
            DropoutLevel::Warning => self.warning += 1,
            DropoutLevel::Critical => self.critical += 1,
            DropoutLevel::Occurred => self.occurred += 1,
        }
    }
}

/// Times each action was recommended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub maintain: u64,
    pub grow_buffer: u64,
    pub shrink_buffer: u64,
    pub engage_rate_conversion: u64,
    pub reduce_processing: u64,
}

impl ActionCounts {
    fn count(&mut self, action: RecommendedAction) {
        match action {
            RecommendedAction::Maintain => self.maintain += 1,
            RecommendedAction::GrowBuffer => self.grow_buffer += 1,
            RecommendedAction::ShrinkBuffer => self.shrink_buffer += 1,
            RecommendedAction::EngageRateConversion => self.engage_rate_conversion += 1,
            RecommendedAction::ReduceProcessing => self.reduce_processing += 1,
        }
    }
}

/// Outcome of [`run_pipeline`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub blocks: usize,
    /// Callbacks that got fewer frames than they asked for
    pub underruns: u64,
    /// Underruns the monitor did not classify as `Occurred`
    pub missed_underruns: u64,
    pub levels: LevelCounts,
    pub actions: ActionCounts,
    pub max_level: DropoutLevel,
    /// Level changes delivered to listeners
    pub level_events: u64,
    /// Prediction notifications delivered to listeners
    pub predictions: u64,
    pub max_buffer_frames: u32,
    pub final_buffer_frames: u32,
    pub frames_converted: u64,
    pub conversion_shortfall: u64,
    /// Scratch allocations the pool could not serve
    pub scratch_exhausted: u64,
    pub pool_in_use_after: usize,
}

impl PipelineReport {
    pub fn passed(&self) -> bool {
        self.violations().is_empty()
    }

    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.missed_underruns > 0 {
            violations.push(format!(
                "{} underruns not classified as dropouts",
                self.missed_underruns
            ));
        }
        if self.scratch_exhausted > 0 {
            violations.push(format!("{} scratch allocations failed", self.scratch_exhausted));
        }
        if self.pool_in_use_after != 0 {
            violations.push(format!(
                "{} pool blocks leaked by the callback",
                self.pool_in_use_after
            ));
        }
        violations
    }
}

#[derive(Default)]
struct EventCounter {
    level_events: AtomicU64,
    predictions: AtomicU64,
}

impl DropoutListener for EventCounter {
    fn dropout_detected(&self, _event: &DropoutEvent) {
        self.level_events.fetch_add(1, Ordering::Relaxed);
    }

    fn dropout_predicted(&self, _probability: f32, _time_to_dropout_secs: f32) {
        self.predictions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sine source that never emits exact zeros for long
struct Tone {
    phase: f64,
    step: f64,
}

impl Tone {
    fn new(sample_rate: u32) -> Self {
        Self {
            phase: 0.25,
            step: TONE_HZ / sample_rate.max(1) as f64,
        }
    }

    fn next(&mut self) -> Sample {
        let value = (self.phase * std::f64::consts::TAU).sin() * 0.5;
        self.phase = (self.phase + self.step).fract();
        value as Sample
    }
}

/// Run the simulated stream
///
/// The pool must hold at least one block of `pipeline_frames` samples.
pub fn run_pipeline(
    pool: &BlockPool,
    monitor: &BufferHealthMonitor,
    config: &HarnessConfig,
) -> Result<PipelineReport> {
    let frames = config.pipeline_frames;
    let capacity = config.ring_capacity_frames;
    let scratch_bytes = frames as usize * std::mem::size_of::<Sample>();
    if !pool.is_initialized() || pool.block_size() < scratch_bytes {
        bail!(
            "Pool blocks of {} bytes cannot hold {} frames",
            pool.block_size(),
            frames
        );
    }
    if config.stall_every > 0 && config.stall_blocks >= config.stall_every {
        bail!(
            "stall_blocks ({}) must be shorter than stall_every ({})",
            config.stall_blocks,
            config.stall_every
        );
    }

    let sample_rate = monitor.config().output_sample_rate;
    let (mut producer, mut consumer) = RingBuffer::<Sample>::new(capacity as usize);
    let mut tone = Tone::new(sample_rate);
    let mut rng = XorShift::new(config.seed);

    let prefill = (capacity as f32 * monitor.target_buffer_level()) as usize;
    if let Ok(mut chunk) = producer.write_chunk(prefill.min(capacity as usize)) {
        let (first, second) = chunk.as_mut_slices();
        first.iter_mut().chain(second.iter_mut()).for_each(|s| *s = tone.next());
        chunk.commit_all();
    }

    let counter = Arc::new(EventCounter::default());
    let listener_id = monitor.add_dropout_listener(counter.clone());

    log::info!(
        "Pipeline: {} blocks of {} frames, ring {} frames, stall {} of every {} blocks",
        config.pipeline_blocks,
        frames,
        capacity,
        config.stall_blocks,
        config.stall_every
    );

    let mut report = PipelineReport {
        blocks: config.pipeline_blocks,
        ..Default::default()
    };
    let mut debt = 0usize;

    for block in 0..config.pipeline_blocks {
        // Producer
        let stalled = config.stall_every > 0
            && block % config.stall_every >= config.stall_every - config.stall_blocks;
        if stalled {
            debt += frames as usize;
        } else {
            let jitter = 1.0 + PRODUCER_JITTER * rng.next_signed();
            let payback = debt.min(frames as usize / 2);
            debt -= payback;
            let want = (frames as f64 * jitter) as usize + payback;
            let n = want.min(producer.slots());
            if let Ok(mut chunk) = producer.write_chunk(n) {
                let (first, second) = chunk.as_mut_slices();
                first.iter_mut().chain(second.iter_mut()).for_each(|s| *s = tone.next());
                chunk.commit_all();
            }
        }

        // Audio callback
        let available = consumer.slots() as u32;
        let timestamp_us = block as u64 * frames as u64 * 1_000_000 / sample_rate.max(1) as u64;
        let recommendation = monitor.record_sample(BufferMetricsSample::new(
            frames,
            available,
            capacity,
            timestamp_us,
        ));
        report.actions.count(recommendation.action);
        report.max_buffer_frames = report.max_buffer_frames.max(recommendation.buffer_frames);
        report.final_buffer_frames = recommendation.buffer_frames;

        let Some(mut scratch) = pool.acquire(scratch_bytes) else {
            report.scratch_exhausted += 1;
            continue;
        };
        let samples = scratch.as_samples_mut();

        let n = (available.min(frames)) as usize;
        if let Ok(chunk) = consumer.read_chunk(n) {
            let (first, second) = chunk.as_slices();
            samples[..first.len()].copy_from_slice(first);
            samples[first.len()..n].copy_from_slice(second);
            chunk.commit_all();
        }
        samples[n..].fill(0.0);

        if n < frames as usize {
            report.underruns += 1;
            if recommendation.level != DropoutLevel::Occurred {
                report.missed_underruns += 1;
            }
        }

        let level = monitor.detect_dropout(&[&samples[..]], frames as usize);
        report.levels.count(level);
        report.max_level = report.max_level.max(level);

        if recommendation.action == RecommendedAction::EngageRateConversion {
            match pool.acquire(pool.block_size()) {
                Some(mut converted) => {
                    let conversion =
                        monitor.process_sample_rate_conversion(scratch.as_samples(), converted.as_samples_mut());
                    report.frames_converted += conversion.output_written as u64;
                    report.conversion_shortfall += conversion.shortfall as u64;
                }
                None => report.scratch_exhausted += 1,
            }
        }
    }

    monitor.remove_dropout_listener(listener_id);
    report.level_events = counter.level_events.load(Ordering::Relaxed);
    report.predictions = counter.predictions.load(Ordering::Relaxed);
    report.pool_in_use_after = pool.in_use();

    if report.passed() {
        log::info!(
            "Pipeline passed: {} underruns, max level {}, {} level events",
            report.underruns,
            report.max_level.display_name(),
            report.level_events
        );
    } else {
        log::warn!("Pipeline failed: {}", report.violations().join(", "));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::PreventionConfig;
    use crate::pool::PoolConfig;

    fn pool() -> BlockPool {
        BlockPool::with_config(PoolConfig::new(4096, 8, 8)).unwrap()
    }

    #[test]
    fn test_long_stall_is_detected() {
        let pool = pool();
        let monitor = BufferHealthMonitor::new(PreventionConfig::default()).unwrap();
        // 10 blocks of 256 frames exceed the whole 2048-frame ring
        let config = HarnessConfig {
            pipeline_blocks: 300,
            stall_every: 100,
            stall_blocks: 10,
            ..Default::default()
        };

        let report = run_pipeline(&pool, &monitor, &config).unwrap();
        assert!(report.passed(), "{:?}", report.violations());
        assert!(report.underruns > 0);
        assert!(report.levels.occurred > 0);
        assert_eq!(report.max_level, DropoutLevel::Occurred);
        assert!(report.level_events > 0);
        assert!(report.actions.grow_buffer > 0);
        assert_eq!(monitor.listener_count(), 0);
    }

    #[test]
    fn test_seed_makes_runs_repeatable() {
        let config = HarnessConfig {
            pipeline_blocks: 400,
            ..Default::default()
        };

        let run = || {
            let pool = pool();
            let monitor = BufferHealthMonitor::new(PreventionConfig::default()).unwrap();
            run_pipeline(&pool, &monitor, &config).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_rejects_small_blocks() {
        let pool = BlockPool::with_config(PoolConfig::new(64, 2, 2)).unwrap();
        let monitor = BufferHealthMonitor::new(PreventionConfig::default()).unwrap();
        assert!(run_pipeline(&pool, &monitor, &HarnessConfig::default()).is_err());
    }
}
