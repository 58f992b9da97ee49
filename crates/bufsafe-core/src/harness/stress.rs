//! Thread-safety stress run
//!
//! Every thread loops allocate -> claim ownership flag -> stamp -> verify ->
//! release flag -> deallocate. A flag that is already set means two threads
//! hold the same block; a stamp that changed under its owner means a block
//! was written by someone else.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use super::HarnessConfig;
use crate::pool::BlockPool;

/// Outcome of [`run_stress`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StressReport {
    pub threads: usize,
    pub cycles_per_thread: usize,
    pub successful_cycles: u64,
    /// Allocations refused because the pool was exhausted
    pub exhausted: u64,
    /// A block was handed to a second owner while still held
    pub duplicate_grants: u64,
    /// A block's contents changed while held by one owner
    pub corrupted_blocks: u64,
    pub final_in_use: usize,
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub elapsed_ms: f64,
}

impl StressReport {
    pub fn passed(&self) -> bool {
        self.violations().is_empty()
    }

    /// Human-readable list of broken guarantees
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.duplicate_grants > 0 {
            violations.push(format!("{} duplicate block grants", self.duplicate_grants));
        }
        if self.corrupted_blocks > 0 {
            violations.push(format!("{} corrupted blocks", self.corrupted_blocks));
        }
        if self.final_in_use != 0 {
            violations.push(format!("{} blocks still in use", self.final_in_use));
        }
        if self.total_allocations != self.total_deallocations {
            violations.push(format!(
                "unbalanced accounting: {} allocations vs {} deallocations",
                self.total_allocations, self.total_deallocations
            ));
        }
        violations
    }
}

/// Run the stress workload against an initialized pool
///
/// Metrics are reset first so the report covers this run only.
pub fn run_stress(pool: &BlockPool, config: &HarnessConfig) -> StressReport {
    let request = config.request_size.min(pool.block_size()).max(1);
    let owners: Vec<AtomicBool> = (0..pool.capacity()).map(|_| AtomicBool::new(false)).collect();
    let successful = AtomicU64::new(0);
    let exhausted = AtomicU64::new(0);
    let duplicates = AtomicU64::new(0);
    let corrupted = AtomicU64::new(0);

    pool.reset_metrics();
    log::info!(
        "Stress: {} threads x {} cycles, {} byte requests",
        config.threads,
        config.cycles_per_thread,
        request
    );

    let started = Instant::now();
    thread::scope(|scope| {
        for t in 0..config.threads {
            let owners = &owners;
            let (successful, exhausted, duplicates, corrupted) =
                (&successful, &exhausted, &duplicates, &corrupted);
            scope.spawn(move || {
                for cycle in 0..config.cycles_per_thread {
                    let Some(mut block) = pool.acquire(request) else {
                        exhausted.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let Some(id) = pool.block_id(block.as_ptr().as_ptr()) else {
                        corrupted.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let flag = &owners[id as usize];
                    if flag.swap(true, Ordering::AcqRel) {
                        duplicates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let stamp = (t as u8).wrapping_mul(31).wrapping_add(cycle as u8);
                    block.fill(stamp);
                    std::hint::spin_loop();
                    if block.iter().any(|&b| b != stamp) {
                        corrupted.fetch_add(1, Ordering::Relaxed);
                    }

                    flag.store(false, Ordering::Release);
                    successful.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });
    let elapsed = started.elapsed();

    let metrics = pool.metrics();
    let report = StressReport {
        threads: config.threads,
        cycles_per_thread: config.cycles_per_thread,
        successful_cycles: successful.into_inner(),
        exhausted: exhausted.into_inner(),
        duplicate_grants: duplicates.into_inner(),
        corrupted_blocks: corrupted.into_inner(),
        final_in_use: pool.in_use(),
        total_allocations: metrics.total_allocations,
        total_deallocations: metrics.total_deallocations,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
    };

    if report.passed() {
        log::info!(
            "Stress passed: {} cycles in {:.1}ms",
            report.successful_cycles,
            report.elapsed_ms
        );
    } else {
        log::warn!("Stress failed: {}", report.violations().join(", "));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    #[test]
    fn test_stress_scenario_balances() {
        let pool = BlockPool::with_config(PoolConfig::new(1024, 64, 512)).unwrap();
        let config = HarnessConfig {
            cycles_per_thread: 2_000,
            ..Default::default()
        };

        let report = run_stress(&pool, &config);
        assert!(report.passed(), "{:?}", report.violations());
        assert_eq!(report.successful_cycles, 8_000);
        assert_eq!(report.total_allocations, 8_000);
        assert_eq!(report.exhausted, 0);
    }

    #[test]
    fn test_exhaustion_is_counted_not_fatal() {
        let pool = BlockPool::with_config(PoolConfig::new(64, 1, 1)).unwrap();
        let _held = pool.acquire(8).unwrap();
        let config = HarnessConfig {
            threads: 2,
            cycles_per_thread: 10,
            ..Default::default()
        };

        let report = run_stress(&pool, &config);
        assert_eq!(report.exhausted, 20);
        assert_eq!(report.successful_cycles, 0);
        // The held block is still out
        assert_eq!(report.final_in_use, 1);
    }
}
