//! Pool metrics
//!
//! Relaxed atomic counters bumped from the hot path and copied out as a
//! [`PoolMetricsSnapshot`]. Snapshots are not linearizable with respect to
//! concurrent allocate/deallocate calls; they are for observation only and
//! nothing in the pool reads them back to make decisions.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Weight of the newest sample in the rolling timing averages
const TIMING_EMA_ALPHA: f64 = 0.01;

/// Counter storage shared by all threads using a pool
pub(crate) struct PoolCounters {
    enabled: AtomicBool,
    total_allocations: AtomicU64,
    total_deallocations: AtomicU64,
    peak_in_use: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
    invalid_frees: AtomicU64,
    grown: AtomicU64,
    /// f64 bit patterns
    avg_allocate_ns: AtomicU64,
    avg_deallocate_ns: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            total_allocations: AtomicU64::new(0),
            total_deallocations: AtomicU64::new(0),
            peak_in_use: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            grown: AtomicU64::new(0),
            avg_allocate_ns: AtomicU64::new(0f64.to_bits()),
            avg_deallocate_ns: AtomicU64::new(0f64.to_bits()),
        }
    }

    #[inline]
    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Start a timing measurement if metrics are on
    #[inline]
    pub(crate) fn start(&self) -> Option<Instant> {
        self.enabled().then(Instant::now)
    }

    #[inline]
    pub(crate) fn record_allocation(&self, in_use: usize, hit: bool, started: Option<Instant>) {
        if !self.enabled() {
            return;
        }
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        self.peak_in_use.fetch_max(in_use as u64, Ordering::Relaxed);
        if let Some(started) = started {
            update_ema(&self.avg_allocate_ns, started.elapsed().as_nanos() as f64);
        }
    }

    #[inline]
    pub(crate) fn record_deallocation(&self, started: Option<Instant>) {
        if !self.enabled() {
            return;
        }
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        if let Some(started) = started {
            update_ema(&self.avg_deallocate_ns, started.elapsed().as_nanos() as f64);
        }
    }

    #[inline]
    pub(crate) fn record_miss(&self) {
        if self.enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_rejected(&self) {
        if self.enabled() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_invalid_free(&self) {
        if self.enabled() {
            self.invalid_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_growth(&self, blocks: usize) {
        if self.enabled() {
            self.grown.fetch_add(blocks as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(
        &self,
        in_use: usize,
        provisioned: usize,
        capacity: usize,
    ) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            current_in_use: in_use as u64,
            peak_in_use: self.peak_in_use.load(Ordering::Relaxed),
            pool_hits: self.hits.load(Ordering::Relaxed),
            pool_misses: self.misses.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            invalid_frees: self.invalid_frees.load(Ordering::Relaxed),
            blocks_grown: self.grown.load(Ordering::Relaxed),
            provisioned_blocks: provisioned as u64,
            capacity_blocks: capacity as u64,
            avg_allocate_ns: f64::from_bits(self.avg_allocate_ns.load(Ordering::Relaxed)),
            avg_deallocate_ns: f64::from_bits(self.avg_deallocate_ns.load(Ordering::Relaxed)),
        }
    }

    /// Zero every counter. Peak restarts from the current in-use count.
    pub(crate) fn reset(&self, in_use: usize) {
        for counter in [
            &self.total_allocations,
            &self.total_deallocations,
            &self.hits,
            &self.misses,
            &self.rejected,
            &self.invalid_frees,
            &self.grown,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.peak_in_use.store(in_use as u64, Ordering::Relaxed);
        self.avg_allocate_ns.store(0f64.to_bits(), Ordering::Relaxed);
        self.avg_deallocate_ns.store(0f64.to_bits(), Ordering::Relaxed);
    }
}

/// Exponential moving average stored as f64 bits.
/// Concurrent updates may overwrite each other; the average stays plausible.
#[inline]
fn update_ema(slot: &AtomicU64, sample_ns: f64) {
    let current = f64::from_bits(slot.load(Ordering::Relaxed));
    let next = if current == 0.0 {
        sample_ns
    } else {
        (1.0 - TIMING_EMA_ALPHA) * current + TIMING_EMA_ALPHA * sample_ns
    };
    slot.store(next.to_bits(), Ordering::Relaxed);
}

/// Point-in-time copy of a pool's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub current_in_use: u64,
    pub peak_in_use: u64,
    /// Allocations served straight from the free list
    pub pool_hits: u64,
    /// Allocations that found the pool exhausted
    pub pool_misses: u64,
    /// Oversize, over-aligned or pre-initialization requests
    pub rejected_requests: u64,
    /// Double frees and foreign pointers that were ignored
    pub invalid_frees: u64,
    pub blocks_grown: u64,
    pub provisioned_blocks: u64,
    pub capacity_blocks: u64,
    pub avg_allocate_ns: f64,
    pub avg_deallocate_ns: f64,
}

impl PoolMetricsSnapshot {
    /// Fraction of allocation attempts that found a free block
    pub fn hit_rate(&self) -> f64 {
        let attempts = self.pool_hits + self.pool_misses;
        if attempts == 0 {
            return 1.0;
        }
        self.pool_hits as f64 / attempts as f64
    }

    /// Every allocation has been returned
    pub fn is_balanced(&self) -> bool {
        self.total_allocations == self.total_deallocations && self.current_in_use == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_counters_stay_zero() {
        let counters = PoolCounters::new(false);
        assert!(counters.start().is_none());
        counters.record_allocation(1, true, None);
        counters.record_miss();
        counters.record_invalid_free();

        let snap = counters.snapshot(0, 4, 4);
        assert_eq!(snap.total_allocations, 0);
        assert_eq!(snap.pool_misses, 0);
        assert_eq!(snap.invalid_frees, 0);
    }

    #[test]
    fn test_peak_tracks_maximum() {
        let counters = PoolCounters::new(true);
        counters.record_allocation(1, true, None);
        counters.record_allocation(5, true, None);
        counters.record_allocation(2, true, None);
        assert_eq!(counters.snapshot(2, 8, 8).peak_in_use, 5);

        counters.reset(2);
        let snap = counters.snapshot(2, 8, 8);
        assert_eq!(snap.peak_in_use, 2);
        assert_eq!(snap.total_allocations, 0);
    }

    #[test]
    fn test_ema_seeds_with_first_sample() {
        let slot = AtomicU64::new(0f64.to_bits());
        update_ema(&slot, 200.0);
        assert_eq!(f64::from_bits(slot.load(Ordering::Relaxed)), 200.0);
        update_ema(&slot, 300.0);
        let avg = f64::from_bits(slot.load(Ordering::Relaxed));
        assert!((avg - 201.0).abs() < 1e-9);
    }

    #[test]
    fn test_hit_rate() {
        let snap = PoolMetricsSnapshot {
            pool_hits: 3,
            pool_misses: 1,
            ..Default::default()
        };
        assert!((snap.hit_rate() - 0.75).abs() < 1e-9);
        assert_eq!(PoolMetricsSnapshot::default().hit_rate(), 1.0);
    }
}
