//! Fixed-capacity rolling history of buffer samples
//!
//! Each slot is a small seqlock: the writer marks the slot odd, stores the
//! fields, then stores the even sequence number of the sample it holds.
//! Readers skip slots that are mid-write or were overwritten while being
//! read. Writers claim sequence numbers with a `fetch_add` on the head and
//! then the slot itself with a CAS, so several real-time threads may record
//! concurrently without locking. A writer that laps a slot still being
//! written drops its sample instead of waiting.

use serde::Serialize;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// One occupancy report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BufferMetricsSample {
    /// `available / capacity`, clamped to 0..=1
    pub fill_ratio: f32,
    /// Frames the consumer asked for
    pub requested: u32,
    /// Frames that were ready
    pub available: u32,
    /// Total buffer size in frames
    pub capacity: u32,
    /// Microseconds since the monitor started
    pub timestamp_us: u64,
}

impl BufferMetricsSample {
    /// Build a sample, deriving the fill ratio
    pub fn new(requested: u32, available: u32, capacity: u32, timestamp_us: u64) -> Self {
        let fill_ratio = if capacity == 0 {
            0.0
        } else {
            (available as f32 / capacity as f32).clamp(0.0, 1.0)
        };
        Self {
            fill_ratio,
            requested,
            available,
            capacity,
            timestamp_us,
        }
    }

    /// The consumer wanted more than was there
    #[inline]
    pub fn is_underrun(&self) -> bool {
        self.available < self.requested
    }
}

#[derive(Default)]
struct Slot {
    seq: AtomicU64,
    fill_bits: AtomicU32,
    requested: AtomicU32,
    available: AtomicU32,
    capacity: AtomicU32,
    timestamp_us: AtomicU64,
}

/// Lock-free ring of the most recent samples
pub struct RollingHistory {
    slots: Box<[Slot]>,
    head: CachePadded<AtomicU64>,
}

impl RollingHistory {
    /// Allocates all slots up front; recording never allocates
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Samples recorded since creation or the last clear
    pub fn total_recorded(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Samples currently retained
    pub fn len(&self) -> usize {
        (self.total_recorded() as usize).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.total_recorded() == 0
    }

    /// Overwrite the oldest slot. O(1), never waits.
    #[inline]
    pub fn record(&self, sample: BufferMetricsSample) {
        let seq = self.head.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[(seq % self.slots.len() as u64) as usize];

        // Claim the slot for this writer; if another writer holds it or a
        // newer sample already landed there, this sample is dropped
        let writing = seq * 2 + 1;
        let current = slot.seq.load(Ordering::Relaxed);
        if current & 1 == 1 || current > writing {
            return;
        }
        if slot
            .seq
            .compare_exchange(current, writing, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        fence(Ordering::Release);
        slot.fill_bits.store(sample.fill_ratio.to_bits(), Ordering::Relaxed);
        slot.requested.store(sample.requested, Ordering::Relaxed);
        slot.available.store(sample.available, Ordering::Relaxed);
        slot.capacity.store(sample.capacity, Ordering::Relaxed);
        slot.timestamp_us.store(sample.timestamp_us, Ordering::Relaxed);
        slot.seq.store(seq * 2 + 2, Ordering::Release);
    }

    /// Read sample number `seq` if it is still intact
    #[inline]
    fn read(&self, seq: u64) -> Option<BufferMetricsSample> {
        let slot = &self.slots[(seq % self.slots.len() as u64) as usize];
        let expected = seq * 2 + 2;
        if slot.seq.load(Ordering::Acquire) != expected {
            return None;
        }
        let sample = BufferMetricsSample {
            fill_ratio: f32::from_bits(slot.fill_bits.load(Ordering::Relaxed)),
            requested: slot.requested.load(Ordering::Relaxed),
            available: slot.available.load(Ordering::Relaxed),
            capacity: slot.capacity.load(Ordering::Relaxed),
            timestamp_us: slot.timestamp_us.load(Ordering::Relaxed),
        };
        fence(Ordering::Acquire);
        (slot.seq.load(Ordering::Relaxed) == expected).then_some(sample)
    }

    /// Most recent intact sample
    pub fn latest(&self) -> Option<BufferMetricsSample> {
        let head = self.total_recorded();
        let oldest = head.saturating_sub(self.slots.len() as u64);
        (oldest..head).rev().find_map(|seq| self.read(seq))
    }

    /// Visit up to `count` of the newest samples, oldest first.
    /// Torn or overwritten slots are skipped. Returns how many were visited.
    pub fn for_each_recent<F>(&self, count: usize, mut visit: F) -> usize
    where
        F: FnMut(&BufferMetricsSample),
    {
        let head = self.total_recorded();
        let span = (count.min(self.slots.len())) as u64;
        let start = head.saturating_sub(span);
        let mut visited = 0;
        for seq in start..head {
            if let Some(sample) = self.read(seq) {
                visit(&sample);
                visited += 1;
            }
        }
        visited
    }

    /// Forget every sample. Not meant to race with `record`.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.seq.store(0, Ordering::Relaxed);
        }
        self.head.store(0, Ordering::Release);
    }
}
