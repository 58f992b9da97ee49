//! Allocation latency measurement
//!
//! Each thread times every `allocate` and `deallocate` separately into its
//! own histogram; the histograms are merged afterwards. Histograms are sized
//! up front so recording never allocates inside the measured loop.

use anyhow::{anyhow, Result};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

use super::HarnessConfig;
use crate::pool::BlockPool;

/// Highest latency the histograms track (1 s)
const MAX_TRACKED_NS: u64 = 1_000_000_000;

/// Latency summary for one operation kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub mean_ns: f64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub max_ns: u64,
}

impl LatencySummary {
    fn from_histogram(h: &Histogram<u64>) -> Self {
        if h.is_empty() {
            return Self::default();
        }
        Self {
            samples: h.len(),
            mean_ns: h.mean(),
            p50_ns: h.value_at_quantile(0.50),
            p99_ns: h.value_at_quantile(0.99),
            p999_ns: h.value_at_quantile(0.999),
            max_ns: h.max(),
        }
    }

    /// Mean under `budget_ns` and p99 under twice that
    pub fn within(&self, budget_ns: u64) -> bool {
        self.mean_ns < budget_ns as f64 && self.p99_ns < budget_ns * 2
    }
}

/// Outcome of [`run_timing`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingReport {
    pub threads: usize,
    pub budget_ns: u64,
    pub allocate: LatencySummary,
    pub deallocate: LatencySummary,
    /// Cycles skipped because the pool was exhausted
    pub exhausted: u64,
}

impl TimingReport {
    pub fn passed(&self) -> bool {
        self.violations().is_empty()
    }

    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (name, summary) in [("allocate", &self.allocate), ("deallocate", &self.deallocate)] {
            if !summary.within(self.budget_ns) {
                violations.push(format!(
                    "{} over budget: mean {:.0}ns, p99 {}ns (budget {}ns)",
                    name, summary.mean_ns, summary.p99_ns, self.budget_ns
                ));
            }
        }
        violations
    }
}

fn new_histogram() -> Result<Histogram<u64>> {
    Histogram::new_with_bounds(1, MAX_TRACKED_NS, 3)
        .map_err(|e| anyhow!("Failed to create latency histogram: {:?}", e))
}

/// Time `cycles_per_thread` allocate/deallocate pairs on every thread
pub fn run_timing(pool: &BlockPool, config: &HarnessConfig) -> Result<TimingReport> {
    let request = config.request_size.min(pool.block_size()).max(1);
    log::info!(
        "Timing: {} threads x {} cycles, budget {}us",
        config.threads,
        config.cycles_per_thread,
        config.latency_budget_us
    );

    let mut allocate = new_histogram()?;
    let mut deallocate = new_histogram()?;
    let per_thread = (0..config.threads)
        .map(|_| -> Result<_> { Ok((new_histogram()?, new_histogram()?)) })
        .collect::<Result<Vec<_>>>()?;

    let results: Vec<(Histogram<u64>, Histogram<u64>, u64)> = thread::scope(|scope| -> Result<_> {
        let workers: Vec<_> = per_thread
            .into_iter()
            .map(|(mut alloc_hist, mut dealloc_hist)| {
                scope.spawn(move || {
                    let mut exhausted = 0u64;
                    for _ in 0..config.cycles_per_thread {
                        let start = Instant::now();
                        let ptr = pool.allocate(request);
                        let alloc_ns = start.elapsed().as_nanos() as u64;

                        let Some(ptr) = ptr else {
                            exhausted += 1;
                            continue;
                        };
                        alloc_hist.saturating_record(alloc_ns.max(1));

                        let start = Instant::now();
                        pool.deallocate(ptr.as_ptr());
                        dealloc_hist.saturating_record((start.elapsed().as_nanos() as u64).max(1));
                    }
                    (alloc_hist, dealloc_hist, exhausted)
                })
            })
            .collect();

        join_workers(workers)
    })?;

    let mut exhausted = 0;
    for (alloc_hist, dealloc_hist, skipped) in &results {
        allocate
            .add(alloc_hist)
            .map_err(|e| anyhow!("Failed to merge histograms: {:?}", e))?;
        deallocate
            .add(dealloc_hist)
            .map_err(|e| anyhow!("Failed to merge histograms: {:?}", e))?;
        exhausted += skipped;
    }

    let report = TimingReport {
        threads: config.threads,
        budget_ns: config.latency_budget_us * 1_000,
        allocate: LatencySummary::from_histogram(&allocate),
        deallocate: LatencySummary::from_histogram(&deallocate),
        exhausted,
    };

    log::info!(
        "Timing: allocate mean {:.0}ns p99 {}ns, deallocate mean {:.0}ns p99 {}ns",
        report.allocate.mean_ns,
        report.allocate.p99_ns,
        report.deallocate.mean_ns,
        report.deallocate.p99_ns
    );
    Ok(report)
}

/// Join every worker; one that panicked fails the whole run
fn join_workers<T>(workers: Vec<ScopedJoinHandle<'_, T>>) -> Result<Vec<T>> {
    workers
        .into_iter()
        .enumerate()
        .map(|(i, worker)| {
            worker
                .join()
                .map_err(|_| anyhow!("Timing worker {} panicked", i))
        })
        .collect()
}
