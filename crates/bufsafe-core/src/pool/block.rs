//! Block metadata and the backing region
//!
//! Metadata lives in a parallel array indexed by block id rather than in a
//! header in front of each slot, so the data area of a block is exactly
//! `block_size` usable bytes and a stray write through a block pointer can
//! never corrupt free-list links.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::error::{PoolError, PoolResult};

/// Written into every block's metadata at construction
const BLOCK_MAGIC: u32 = 0xB10C_5AFE;

/// Per-block bookkeeping
pub(crate) struct BlockMeta {
    /// Free-list link (index of the next free block, or the sentinel)
    pub(crate) next: AtomicU32,
    /// Checked out to a caller
    in_use: AtomicBool,
    /// Stable block id (equals the block's index)
    id: u32,
    /// `BLOCK_MAGIC ^ id`, verified on every deallocation
    tag: u32,
}

impl BlockMeta {
    pub(crate) fn new(id: u32, next: u32) -> Self {
        Self {
            next: AtomicU32::new(next),
            in_use: AtomicBool::new(false),
            id,
            tag: BLOCK_MAGIC ^ id,
        }
    }

    /// Validity check against the index the caller derived from a pointer
    #[inline]
    pub(crate) fn is_valid(&self, index: u32) -> bool {
        self.id == index && self.tag == BLOCK_MAGIC ^ index
    }

    /// Mark in use. Fails if the block is already checked out.
    #[inline]
    pub(crate) fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark free. Fails if the block is not checked out, which turns a
    /// double free (even a concurrent one) into a no-op.
    #[inline]
    pub(crate) fn try_release(&self) -> bool {
        self.in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

/// One contiguous, zeroed, aligned allocation holding every block's data
pub(crate) struct Region {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain bytes. Exclusive access to each block is
// handed out by the free-list protocol, never by sharing the Region itself.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve `bytes` bytes aligned to `align`
    ///
    /// Zeroed so that a fresh block never exposes uninitialized memory
    /// through the pool's slice views. Large zeroed allocations come straight
    /// from the OS and are committed lazily.
    pub(crate) fn allocate(bytes: usize, align: usize) -> PoolResult<Self> {
        let layout = Layout::from_size_align(bytes.max(1), align)
            .map_err(|_| PoolError::AllocationFailed { bytes })?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(PoolError::AllocationFailed { bytes })?;
        Ok(Self { base, layout })
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn start_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `Region::allocate` with this exact layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
