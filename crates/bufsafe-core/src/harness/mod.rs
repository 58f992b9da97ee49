//! Verification harness
//!
//! Three workloads exercise the pool and monitor the way an audio pipeline
//! would and report whether the guarantees held:
//!
//! - [`stress`]: threads hammer one pool and check no block is ever handed
//!   to two owners at once
//! - [`timing`]: per-operation allocate/deallocate latency against a budget
//! - [`pipeline`]: a simulated producer/consumer stream with stalls, driving
//!   the monitor with pool-backed scratch buffers
//!
//! Used by the `bufsafe-bench` binary and by the crate's own tests.

pub mod pipeline;
pub mod stress;
pub mod timing;

pub use pipeline::{run_pipeline, PipelineReport};
pub use stress::{run_stress, StressReport};
pub use timing::{run_timing, TimingReport};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Harness parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Concurrent threads for stress and timing runs
    pub threads: usize,

    /// Allocate/deallocate cycles per thread
    pub cycles_per_thread: usize,

    /// Bytes requested per allocation
    pub request_size: usize,

    /// Mean latency budget per operation; p99 may reach twice this
    pub latency_budget_us: u64,

    /// Audio blocks simulated by the pipeline run
    pub pipeline_blocks: usize,

    /// Frames the consumer pulls per block
    pub pipeline_frames: u32,

    /// Ring capacity between producer and consumer (frames)
    pub ring_capacity_frames: u32,

    /// The producer stalls once every this many blocks (0 = never)
    pub stall_every: usize,

    /// Blocks each stall lasts
    pub stall_blocks: usize,

    /// Seed for the producer's jitter
    pub seed: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            cycles_per_thread: 10_000,
            request_size: 512,
            latency_budget_us: 50,
            pipeline_blocks: 2_000,
            pipeline_frames: 256,
            ring_capacity_frames: 2_048,
            stall_every: 250,
            stall_blocks: 6,
            seed: 0x5EED_B10C,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.cycles_per_thread == 0 {
            bail!("cycles_per_thread must be at least 1");
        }
        if self.latency_budget_us == 0 {
            bail!("latency_budget_us must be greater than zero");
        }
        if self.pipeline_frames == 0 || self.ring_capacity_frames < self.pipeline_frames {
            bail!(
                "ring_capacity_frames ({}) must hold at least one block of pipeline_frames ({})",
                self.ring_capacity_frames,
                self.pipeline_frames
            );
        }
        Ok(())
    }
}

/// Small deterministic generator for reproducible runs
#[derive(Debug, Clone)]
pub(crate) struct XorShift(u64);

impl XorShift {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in `[-1, 1)`
    pub(crate) fn next_signed(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 52) as f64 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(HarnessConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ring_must_hold_a_block() {
        let config = HarnessConfig {
            ring_capacity_frames: 128,
            pipeline_frames: 256,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_xorshift_is_deterministic_and_bounded() {
        let mut a = XorShift::new(7);
        let mut b = XorShift::new(7);
        for _ in 0..1000 {
            let x = a.next_signed();
            assert_eq!(x, b.next_signed());
            assert!((-1.0..1.0).contains(&x));
        }
    }
}
