//! Bufsafe Core - Real-time memory and buffer-health subsystem
//!
//! Two components sit underneath every audio callback:
//!
//! - [`pool::BlockPool`]: lock-free fixed-block allocator. One region is
//!   reserved at initialization; afterwards blocks only move between the
//!   free list and their borrowers via CAS.
//! - [`monitor::BufferHealthMonitor`]: tracks buffer occupancy, classifies
//!   dropout risk with hysteresis, predicts time-to-dropout and recommends
//!   a buffering strategy, all without allocating.
//!
//! The remaining modules are the ambient stack around them: YAML config,
//! the deferred-reclamation thread, interpolation used for rate conversion,
//! and the verification harness.

pub mod config;
pub mod gc;
pub mod harness;
pub mod monitor;
pub mod pool;
pub mod resample;
pub mod types;

pub use types::*;
