//! Lock-free fixed-block memory pool
//!
//! [`BlockPool`] reserves one contiguous region at [`BlockPool::initialize`]
//! and slices it into equally sized, aligned blocks. After that, allocation
//! and deallocation only move block indices between a lock-free free list and
//! their borrowers: no locks, no calls into the global allocator.
//!
//! # Real-time Safety
//!
//! - `allocate`, `allocate_aligned`, `acquire`, `deallocate`, `grow`,
//!   `contains_pointer` and `metrics` never lock, block or allocate
//! - `initialize` and `shutdown` allocate/free the region and log; call them
//!   from a setup thread
//!
//! Misuse on the hot path (oversized requests, double frees, foreign
//! pointers) is answered with `None` or a silent no-op, never a panic.

mod block;
mod config;
mod error;
mod free_list;
mod metrics;

pub use config::{PoolConfig, DEFAULT_ALIGNMENT, DEFAULT_BLOCK_SIZE, MAX_BLOCKS, MIN_ALIGNMENT};
pub use error::{PoolError, PoolResult};
pub use metrics::PoolMetricsSnapshot;

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::types::Sample;
use block::{BlockMeta, Region};
use free_list::{FreeList, NIL};
use metrics::PoolCounters;

/// Live state of an initialized pool
struct PoolInner {
    config: PoolConfig,
    stride: usize,
    region: Region,
    /// One entry per reserved block (`max_block_count`)
    blocks: Box<[BlockMeta]>,
    free: FreeList,
    /// Blocks that have ever been linked into the free list
    provisioned: CachePadded<AtomicUsize>,
    in_use: CachePadded<AtomicUsize>,
}

impl PoolInner {
    fn build(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let bytes = config.region_bytes()?;
        let stride = config.stride().ok_or(PoolError::RegionTooLarge {
            block_size: config.block_size,
            blocks: config.max_block_count,
        })?;

        let capacity = config.max_block_count;
        let initial = config.initial_block_count as u32;

        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(capacity)
            .map_err(|_| PoolError::AllocationFailed {
                bytes: capacity * std::mem::size_of::<BlockMeta>(),
            })?;
        blocks.extend((0..capacity as u32).map(|id| {
            let next = if id + 1 < initial { id + 1 } else { NIL };
            BlockMeta::new(id, next)
        }));

        let region = Region::allocate(bytes, config.layout_alignment())?;

        Ok(Self {
            stride,
            region,
            blocks: blocks.into_boxed_slice(),
            free: FreeList::with_head(0),
            provisioned: CachePadded::new(AtomicUsize::new(config.initial_block_count)),
            in_use: CachePadded::new(AtomicUsize::new(0)),
            config,
        })
    }

    #[inline]
    fn block_ptr(&self, index: u32) -> NonNull<u8> {
        let offset = index as usize * self.stride;
        // SAFETY: index < max_block_count, so the offset stays inside the
        // region, and a pointer derived from a non-null base is non-null
        unsafe { NonNull::new_unchecked(self.region.base().as_ptr().add(offset)) }
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        let start = self.region.start_addr();
        addr >= start && addr - start < self.region.len()
    }

    /// Map a pointer back to its block index if it is the start of a
    /// provisioned block
    #[inline]
    fn index_of(&self, ptr: *const u8) -> Option<u32> {
        let addr = ptr as usize;
        if ptr.is_null() || !self.contains(addr) {
            return None;
        }
        let offset = addr - self.region.start_addr();
        if offset % self.stride != 0 {
            return None;
        }
        let index = offset / self.stride;
        if index >= self.provisioned.load(Ordering::Acquire) {
            return None;
        }
        Some(index as u32)
    }

    /// Link up to `additional` reserved blocks into the free list
    fn grow(&self, additional: usize) -> usize {
        let capacity = self.blocks.len();
        let mut start = self.provisioned.load(Ordering::Acquire);
        loop {
            let end = start.saturating_add(additional).min(capacity);
            if end <= start {
                return 0;
            }
            match self.provisioned.compare_exchange_weak(
                start,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // The range start..end now belongs to this thread alone
                    for index in start..end - 1 {
                        self.blocks[index]
                            .next
                            .store(index as u32 + 1, Ordering::Relaxed);
                    }
                    self.free
                        .push_chain(start as u32, (end - 1) as u32, &self.blocks);
                    return end - start;
                }
                Err(current) => start = current,
            }
        }
    }
}

/// Lock-free pool of fixed-size, aligned memory blocks
///
/// Owned explicitly and shared by reference (or `Arc`) with every component
/// that needs scratch memory. Dropping the pool releases the region.
pub struct BlockPool {
    inner: Option<PoolInner>,
    counters: PoolCounters,
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPool {
    /// Create an uninitialized pool. Every allocation fails until
    /// [`initialize`](Self::initialize) succeeds.
    pub fn new() -> Self {
        Self {
            inner: None,
            counters: PoolCounters::new(true),
        }
    }

    /// Create and initialize in one step
    pub fn with_config(config: PoolConfig) -> PoolResult<Self> {
        let mut pool = Self::new();
        pool.initialize(config)?;
        Ok(pool)
    }

    /// Reserve the region and populate the free list
    ///
    /// All-or-nothing: on error the pool stays uninitialized.
    /// **NOT real-time safe.**
    pub fn initialize(&mut self, config: PoolConfig) -> PoolResult<()> {
        if self.inner.is_some() {
            return Err(PoolError::AlreadyInitialized);
        }

        let inner = PoolInner::build(config).map_err(|e| {
            log::error!("Block pool initialization failed: {}", e);
            e
        })?;

        log::info!(
            "Block pool initialized: {} x {} bytes (stride {}, align {}), {} of {} blocks provisioned",
            inner.config.block_size,
            inner.config.initial_block_count,
            inner.stride,
            inner.config.layout_alignment(),
            inner.config.initial_block_count,
            inner.config.max_block_count,
        );

        self.counters.set_enabled(inner.config.metrics_enabled);
        self.counters.reset(0);
        self.inner = Some(inner);
        Ok(())
    }

    /// Release the region. Pointers still held by callers dangle afterwards.
    /// **NOT real-time safe.**
    pub fn shutdown(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let leaked = inner.in_use.load(Ordering::Acquire);
        if leaked > 0 {
            log::warn!(
                "Block pool shut down with {} block(s) still checked out",
                leaked
            );
        }
        log::info!(
            "Block pool shut down ({} allocations served)",
            self.metrics().total_allocations
        );
    }

    /// Check out a block able to hold `size` bytes
    ///
    /// `None` if the pool is uninitialized, `size` exceeds the block size,
    /// or no block is free (and automatic growth, if configured, has reached
    /// the ceiling). Exhaustion is an expected outcome: skip optional work
    /// instead of retrying in a loop.
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let Some(inner) = self.inner.as_ref() else {
            self.counters.record_rejected();
            return None;
        };
        if size > inner.config.block_size {
            self.counters.record_rejected();
            return None;
        }

        let started = self.counters.start();
        let (index, hit) = match inner.free.pop(&inner.blocks) {
            Some(index) => (index, true),
            None => {
                self.counters.record_miss();
                let step = inner.config.growth_step;
                if step == 0 {
                    return None;
                }
                // Racing allocators may take the fresh blocks first; keep
                // provisioning until one is ours or the ceiling is reached
                loop {
                    let grown = inner.grow(step);
                    if grown > 0 {
                        self.counters.record_growth(grown);
                    }
                    if let Some(index) = inner.free.pop(&inner.blocks) {
                        break (index, false);
                    }
                    if grown == 0 {
                        return None;
                    }
                }
            }
        };

        let claimed = inner.blocks[index as usize].try_claim();
        debug_assert!(claimed, "block {} was on the free list while in use", index);

        let in_use = inner.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.record_allocation(in_use, hit, started);
        Some(inner.block_ptr(index))
    }

    /// Like [`allocate`](Self::allocate) with an explicit alignment
    ///
    /// Every block already satisfies the layout alignment fixed at
    /// initialization, so this costs the same. `None` if `alignment` is not a
    /// power of two or exceeds that layout alignment.
    #[inline]
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let supported = self
            .inner
            .as_ref()
            .map(|inner| inner.config.layout_alignment())
            .unwrap_or(0);
        if !alignment.is_power_of_two() || alignment > supported {
            self.counters.record_rejected();
            return None;
        }
        self.allocate(size)
    }

    /// Check out a block wrapped in a guard that returns it on drop
    #[inline]
    pub fn acquire(&self, size: usize) -> Option<PooledBlock<'_>> {
        let ptr = self.allocate(size)?;
        Some(PooledBlock {
            pool: self,
            ptr,
            len: size,
        })
    }

    /// Return a block to the pool
    ///
    /// No-op for null, foreign or interior pointers, and for blocks that are
    /// already free (including a concurrent double free).
    #[inline]
    pub fn deallocate(&self, ptr: *mut u8) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if ptr.is_null() {
            return;
        }
        let started = self.counters.start();

        let Some(index) = inner.index_of(ptr) else {
            self.counters.record_invalid_free();
            return;
        };
        let meta = &inner.blocks[index as usize];
        if !meta.is_valid(index) || !meta.try_release() {
            self.counters.record_invalid_free();
            return;
        }

        inner.in_use.fetch_sub(1, Ordering::AcqRel);
        inner.free.push(index, &inner.blocks);
        self.counters.record_deallocation(started);
    }

    /// O(1) range check against the pool's region
    #[inline]
    pub fn contains_pointer(&self, ptr: *const u8) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.contains(ptr as usize))
    }

    /// Stable id of the checked-out block starting at `ptr`
    pub fn block_id(&self, ptr: *const u8) -> Option<u32> {
        let inner = self.inner.as_ref()?;
        let index = inner.index_of(ptr)?;
        inner.blocks[index as usize]
            .is_in_use()
            .then_some(index)
    }

    /// Provision up to `additional` reserved blocks
    ///
    /// Returns how many were added (0 at the ceiling). Never allocates, so it
    /// is safe to call from the audio thread.
    pub fn grow(&self, additional: usize) -> usize {
        let Some(inner) = self.inner.as_ref() else {
            return 0;
        };
        if additional == 0 {
            return 0;
        }
        let grown = inner.grow(additional);
        if grown > 0 {
            self.counters.record_growth(grown);
        }
        grown
    }

    /// Copy of the counters; may lag concurrent operations
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.counters
            .snapshot(self.in_use(), self.provisioned(), self.capacity())
    }

    pub fn reset_metrics(&self) {
        self.counters.reset(self.in_use());
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    pub fn config(&self) -> Option<&PoolConfig> {
        self.inner.as_ref().map(|inner| &inner.config)
    }

    /// Reserved blocks (`max_block_count`)
    pub fn capacity(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.blocks.len())
    }

    /// Blocks linked into circulation so far
    pub fn provisioned(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.provisioned.load(Ordering::Acquire))
    }

    /// Blocks currently checked out
    pub fn in_use(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.in_use.load(Ordering::Acquire))
    }

    /// Provisioned blocks not checked out (approximate under contention)
    pub fn available(&self) -> usize {
        self.provisioned().saturating_sub(self.in_use())
    }

    /// Free list is empty right now
    pub fn is_exhausted(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |inner| inner.free.peek().is_none())
    }

    pub fn block_size(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.config.block_size)
    }

    /// Alignment every returned pointer satisfies
    pub fn alignment(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.config.layout_alignment())
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A checked-out block that goes back to its pool when dropped
///
/// Dereferences to the requested number of bytes.
pub struct PooledBlock<'a> {
    pool: &'a BlockPool,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a> PooledBlock<'a> {
    /// Start of the block
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The block viewed as samples (length truncated to whole samples)
    pub fn as_samples(&self) -> &[Sample] {
        let whole = self.len - self.len % std::mem::size_of::<Sample>();
        bytemuck::try_cast_slice(&self[..whole]).unwrap_or_default()
    }

    pub fn as_samples_mut(&mut self) -> &mut [Sample] {
        let whole = self.len - self.len % std::mem::size_of::<Sample>();
        bytemuck::try_cast_slice_mut(&mut self[..whole]).unwrap_or_default()
    }

    /// Give up the guard; the caller must `deallocate` the pointer later
    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Deref for PooledBlock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the block is checked out to this guard exclusively and
        // `len <= block_size` was checked at allocation
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PooledBlock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` guarantees a unique borrow
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PooledBlock<'_> {
    fn drop(&mut self) {
        self.pool.deallocate(self.ptr.as_ptr());
    }
}

// SAFETY: a guard is the unique owner of its block; the pool is Sync
unsafe impl Send for PooledBlock<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn small_pool(blocks: usize) -> BlockPool {
        BlockPool::with_config(PoolConfig::new(256, blocks, blocks)).unwrap()
    }

    #[test]
    fn test_allocate_and_return() {
        let pool = small_pool(4);
        let ptr = pool.allocate(128).unwrap();
        assert!(pool.contains_pointer(ptr.as_ptr()));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.available(), 3);

        pool.deallocate(ptr.as_ptr());
        assert_eq!(pool.in_use(), 0);

        let metrics = pool.metrics();
        assert_eq!(metrics.total_allocations, 1);
        assert_eq!(metrics.total_deallocations, 1);
        assert!(metrics.is_balanced());
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = small_pool(2);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(1).unwrap();
        assert_ne!(a, b);
        assert!(pool.is_exhausted());
        assert!(pool.allocate(1).is_none());
        assert_eq!(pool.metrics().pool_misses, 1);

        pool.deallocate(a.as_ptr());
        assert!(pool.allocate(1).is_some());
    }

    #[test]
    fn test_oversize_request_rejected() {
        let pool = small_pool(2);
        assert!(pool.allocate(256).is_some());
        assert!(pool.allocate(257).is_none());
        assert_eq!(pool.metrics().rejected_requests, 1);
    }

    #[test]
    fn test_uninitialized_pool_refuses_everything() {
        let pool = BlockPool::new();
        assert!(!pool.is_initialized());
        assert!(pool.allocate(1).is_none());
        assert!(pool.acquire(1).is_none());
        assert_eq!(pool.grow(4), 0);
        assert!(!pool.contains_pointer(std::ptr::null()));
        pool.deallocate(0x1000 as *mut u8);
    }

    #[test]
    fn test_failed_initialize_leaves_pool_uninitialized() {
        let mut pool = BlockPool::new();
        assert_eq!(
            pool.initialize(PoolConfig::new(0, 1, 1)),
            Err(PoolError::ZeroBlockSize)
        );
        assert!(!pool.is_initialized());
        assert!(pool.initialize(PoolConfig::new(64, 1, 1)).is_ok());
    }

    #[test]
    fn test_initialize_twice_fails() {
        let mut pool = small_pool(2);
        assert_eq!(
            pool.initialize(PoolConfig::default()),
            Err(PoolError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_every_block_is_aligned() {
        let pool =
            BlockPool::with_config(PoolConfig::new(100, 8, 8).with_alignment(128)).unwrap();
        assert_eq!(pool.alignment(), 128);
        let ptrs: Vec<_> = (0..8).map(|_| pool.allocate(100).unwrap()).collect();
        for ptr in &ptrs {
            assert_eq!(ptr.as_ptr() as usize % 128, 0);
        }
        for ptr in ptrs {
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_allocate_aligned_respects_layout() {
        let pool = BlockPool::with_config(PoolConfig::new(64, 2, 2).with_alignment(64)).unwrap();
        let ptr = pool.allocate_aligned(64, 32).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 32, 0);
        assert!(pool.allocate_aligned(64, 4096).is_none());
        assert!(pool.allocate_aligned(64, 3).is_none());
    }

    #[test]
    fn test_double_free_is_harmless() {
        let pool = small_pool(32);
        let first: Vec<_> = (0..10).map(|_| pool.allocate(64).unwrap()).collect();

        pool.deallocate(first[3].as_ptr());
        pool.deallocate(first[3].as_ptr());
        assert_eq!(pool.metrics().invalid_frees, 1);

        let second: Vec<_> = (0..10).map(|_| pool.allocate(64).unwrap()).collect();
        let distinct: HashSet<_> = second.iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(distinct.len(), 10);

        // None of the new blocks may alias a block that is still out
        for (i, ptr) in first.iter().enumerate() {
            if i != 3 {
                assert!(!distinct.contains(&(ptr.as_ptr() as usize)));
            }
        }
        assert_eq!(pool.in_use(), 19);
    }

    #[test]
    fn test_foreign_and_interior_pointers_ignored() {
        let pool = small_pool(4);
        let mut local = [0u8; 16];
        pool.deallocate(local.as_mut_ptr());
        pool.deallocate(std::ptr::null_mut());

        let ptr = pool.allocate(16).unwrap();
        // SAFETY: stays inside the block
        let interior = unsafe { ptr.as_ptr().add(8) };
        assert!(pool.contains_pointer(interior));
        pool.deallocate(interior);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.metrics().invalid_frees, 2);
        assert!(!pool.contains_pointer(local.as_ptr()));
    }

    #[test]
    fn test_block_ids_are_stable() {
        let pool = small_pool(4);
        let ptr = pool.allocate(1).unwrap();
        let id = pool.block_id(ptr.as_ptr()).unwrap();
        assert!(id < 4);
        pool.deallocate(ptr.as_ptr());
        assert_eq!(pool.block_id(ptr.as_ptr()), None);

        // LIFO: the same block comes straight back
        let again = pool.allocate(1).unwrap();
        assert_eq!(pool.block_id(again.as_ptr()), Some(id));
    }

    #[test]
    fn test_grow_up_to_ceiling() {
        let pool = BlockPool::with_config(PoolConfig::new(64, 2, 5)).unwrap();
        assert_eq!(pool.capacity(), 5);
        assert_eq!(pool.provisioned(), 2);

        let held: Vec<_> = (0..2).map(|_| pool.allocate(1).unwrap()).collect();
        assert!(pool.allocate(1).is_none());

        assert_eq!(pool.grow(2), 2);
        assert_eq!(pool.grow(10), 1);
        assert_eq!(pool.grow(1), 0);
        assert_eq!(pool.provisioned(), 5);

        let more: Vec<_> = (0..3).map(|_| pool.allocate(1).unwrap()).collect();
        assert!(pool.allocate(1).is_none());
        assert_eq!(pool.metrics().blocks_grown, 3);

        let all: HashSet<_> = held.iter().chain(&more).map(|p| p.as_ptr() as usize).collect();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_concurrent_growth_stays_within_ceiling() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 32;
        let pool = Arc::new(
            BlockPool::with_config(PoolConfig::new(64, 4, THREADS * PER_THREAD).with_growth_step(3))
                .unwrap(),
        );

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut held = Vec::with_capacity(PER_THREAD);
                    let mut attempts = 0;
                    // The last blocks can be briefly provisioned but not yet
                    // pushed by the thread that grew them
                    while held.len() < PER_THREAD && attempts < 1_000_000 {
                        attempts += 1;
                        match pool.allocate(8) {
                            Some(ptr) => held.push(ptr.as_ptr() as usize),
                            None => thread::yield_now(),
                        }
                    }
                    held
                })
            })
            .collect();

        let held: Vec<usize> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        let distinct: HashSet<_> = held.iter().copied().collect();

        assert_eq!(held.len(), THREADS * PER_THREAD);
        assert_eq!(distinct.len(), held.len());
        assert_eq!(pool.provisioned(), pool.capacity());
        assert!(pool.allocate(8).is_none());
        assert!(held.iter().all(|&p| pool.contains_pointer(p as *const u8)));

        let metrics = pool.metrics();
        assert_eq!(metrics.blocks_grown, (THREADS * PER_THREAD - 4) as u64);
        assert_eq!(metrics.current_in_use, (THREADS * PER_THREAD) as u64);

        for p in held {
            pool.deallocate(p as *mut u8);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_automatic_growth_on_exhaustion() {
        let pool =
            BlockPool::with_config(PoolConfig::new(64, 1, 3).with_growth_step(1)).unwrap();
        let ptrs: Vec<_> = (0..3).map(|_| pool.allocate(1).unwrap()).collect();
        assert!(pool.allocate(1).is_none());

        let metrics = pool.metrics();
        assert_eq!(metrics.pool_hits, 1);
        assert_eq!(metrics.pool_misses, 3);
        assert_eq!(metrics.blocks_grown, 2);
        assert_eq!(metrics.total_allocations, 3);
        for ptr in ptrs {
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_pooled_block_guard() {
        let pool = small_pool(2);
        {
            let mut block = pool.acquire(64).unwrap();
            assert_eq!(block.len(), 64);
            assert!(block.iter().all(|&b| b == 0), "fresh blocks are zeroed");
            let samples = block.as_samples_mut();
            assert_eq!(samples.len(), 16);
            samples[0] = 0.5;
            assert_eq!(block.as_samples()[0], 0.5);
            assert_eq!(pool.in_use(), 1);
        }
        assert_eq!(pool.in_use(), 0);

        let raw = pool.acquire(10).unwrap().into_raw();
        assert_eq!(pool.in_use(), 1);
        pool.deallocate(raw.as_ptr());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_shutdown_and_reinitialize() {
        let mut pool = small_pool(4);
        let _leaked = pool.allocate(1).unwrap();
        pool.shutdown();
        assert!(!pool.is_initialized());
        assert_eq!(pool.capacity(), 0);

        pool.initialize(PoolConfig::new(128, 2, 2)).unwrap();
        assert_eq!(pool.block_size(), 128);
        assert_eq!(pool.metrics().total_allocations, 0);
    }

    #[test]
    fn test_reset_metrics_keeps_in_use() {
        let pool = small_pool(4);
        let ptr = pool.allocate(1).unwrap();
        pool.reset_metrics();
        let metrics = pool.metrics();
        assert_eq!(metrics.total_allocations, 0);
        assert_eq!(metrics.current_in_use, 1);
        assert_eq!(metrics.peak_in_use, 1);
        pool.deallocate(ptr.as_ptr());
    }

    #[test]
    fn test_metrics_disabled() {
        let pool = BlockPool::with_config(PoolConfig::new(64, 2, 2).with_metrics(false)).unwrap();
        let ptr = pool.allocate(1).unwrap();
        pool.deallocate(ptr.as_ptr());
        let metrics = pool.metrics();
        assert_eq!(metrics.total_allocations, 0);
        assert_eq!(metrics.current_in_use, 0);
    }

    #[test]
    fn test_concurrent_cycles_never_share_a_block() {
        const THREADS: usize = 4;
        const CYCLES: usize = 10_000;

        let pool = Arc::new(BlockPool::with_config(PoolConfig::new(1024, 64, 512)).unwrap());
        let owned: Arc<Vec<AtomicBool>> =
            Arc::new((0..512).map(|_| AtomicBool::new(false)).collect());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pool = Arc::clone(&pool);
                let owned = Arc::clone(&owned);
                thread::spawn(move || {
                    for cycle in 0..CYCLES {
                        let mut block = pool.acquire(512).expect("pool exhausted");
                        let id = pool.block_id(block.as_ptr().as_ptr()).unwrap() as usize;
                        assert!(
                            !owned[id].swap(true, Ordering::AcqRel),
                            "block {} handed out twice",
                            id
                        );
                        let stamp = (t * 31 + cycle) as u8;
                        block.fill(stamp);
                        assert!(block.iter().all(|&b| b == stamp));
                        owned[id].store(false, Ordering::Release);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.current_in_use, 0);
        assert_eq!(metrics.total_allocations, (THREADS * CYCLES) as u64);
        assert_eq!(metrics.total_deallocations, (THREADS * CYCLES) as u64);
        assert_eq!(metrics.pool_misses, 0);
        assert!(metrics.is_balanced());
    }
}
