//! Proves the per-callback paths never touch the global allocator
//!
//! A counting allocator tallies allocations per thread, but only while that
//! thread has switched counting on, so setup code and concurrently running
//! tests do not pollute the measurement.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bufsafe_core::monitor::{
    BufferHealthMonitor, DropoutEvent, DropoutListener, PreventionConfig, PreventionStrategy,
};
use bufsafe_core::pool::{BlockPool, PoolConfig};
use bufsafe_core::resample::{InterpolationMethod, RateConverter};

struct CountingAllocator;

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn note_allocation() {
    let counting = COUNTING.try_with(|c| c.get()).unwrap_or(false);
    if counting {
        let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        note_allocation();
        unsafe { System.realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Run `f` and return how many allocations it made on this thread
fn allocations_during<R>(f: impl FnOnce() -> R) -> (R, usize) {
    ALLOCATIONS.with(|n| n.set(0));
    COUNTING.with(|c| c.set(true));
    let result = f();
    COUNTING.with(|c| c.set(false));
    (result, ALLOCATIONS.with(|n| n.get()))
}

#[test]
fn test_counter_sees_allocations() {
    let (_, count) = allocations_during(|| vec![1u8; 16]);
    assert!(count >= 1);
}

#[test]
fn test_pool_cycles_allocate_nothing_under_contention() {
    let pool = Arc::new(BlockPool::with_config(PoolConfig::new(1024, 64, 512)).unwrap());

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let (failed, count) = allocations_during(|| {
                    let mut failed = 0;
                    for i in 0..10_000usize {
                        match pool.allocate(512) {
                            Some(ptr) => {
                                // SAFETY: the block is ours until deallocated
                                unsafe { ptr.as_ptr().write(i as u8) };
                                pool.deallocate(ptr.as_ptr());
                            }
                            None => failed += 1,
                        }
                    }
                    failed
                });
                (failed, count)
            })
        })
        .collect();

    for worker in workers {
        let (failed, count) = worker.join().unwrap();
        assert_eq!(failed, 0);
        assert_eq!(count, 0, "hot path allocated {} times", count);
    }

    let metrics = pool.metrics();
    assert_eq!(metrics.current_in_use, 0);
    assert_eq!(metrics.total_allocations, 40_000);
    assert_eq!(metrics.total_deallocations, 40_000);
}

#[derive(Default)]
struct Flag(AtomicBool);

impl DropoutListener for Flag {
    fn dropout_detected(&self, _event: &DropoutEvent) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[test]
fn test_monitor_callbacks_allocate_nothing() {
    let pool = BlockPool::with_config(PoolConfig::new(4096, 8, 8).with_growth_step(0)).unwrap();
    let monitor =
        BufferHealthMonitor::new(PreventionConfig::with_strategy(PreventionStrategy::Predictive))
            .unwrap();
    let listener = Arc::new(Flag::default());
    monitor.add_dropout_listener(listener.clone());
    let mut converter = RateConverter::from_rates(44_100, 48_000, InterpolationMethod::Sinc);

    let (_, count) = allocations_during(|| {
        for block in 0..2_000u32 {
            let available = match block % 100 {
                // Periodic drain down to an underrun
                90..=99 => (99 - block % 100) * 20,
                n => 400 + n * 4,
            };
            let recommendation = monitor.update_buffer_metrics(256, available, 1024);

            let Some(mut input) = pool.acquire(1024) else {
                continue;
            };
            input.as_samples_mut().fill(0.25);
            let level = monitor.detect_dropout(&[input.as_samples()], 256);
            std::hint::black_box((level, recommendation));

            if let Some(mut output) = pool.acquire(4096) {
                monitor.process_sample_rate_conversion(input.as_samples(), output.as_samples_mut());
                converter.process(input.as_samples(), output.as_samples_mut());
            }
        }
        monitor.report_underrun();
        monitor.current_buffer_metrics()
    });

    assert_eq!(count, 0, "monitor hot path allocated {} times", count);
    assert!(listener.0.load(Ordering::Relaxed));
    assert_eq!(pool.in_use(), 0);
}
