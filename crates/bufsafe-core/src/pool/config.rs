//! Block pool configuration
//!
//! Sizes are fixed for the pool's lifetime: the region is reserved once for
//! `max_block_count` blocks and never reallocated.

use serde::{Deserialize, Serialize};

use super::error::{PoolError, PoolResult};

/// Default block size: 1024 `f32` samples
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default alignment: one cache line
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Lower bound on the layout alignment, whatever the config asks for.
/// Keeps every block castable to a `Sample` slice.
pub const MIN_ALIGNMENT: usize = 16;

/// Highest block index usable; `u32::MAX` is the free-list sentinel
pub const MAX_BLOCKS: usize = (u32::MAX - 1) as usize;

/// Configuration for a [`BlockPool`](super::BlockPool)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size of every block in bytes (the largest single allocation)
    pub block_size: usize,

    /// Blocks on the free list right after initialization
    pub initial_block_count: usize,

    /// Growth ceiling. The region is reserved for this many blocks;
    /// blocks past `initial_block_count` are provisioned by `grow()`.
    pub max_block_count: usize,

    /// Every returned pointer is a multiple of this value (power of two)
    pub alignment: usize,

    /// Toggle counter and timing bookkeeping
    pub metrics_enabled: bool,

    /// Blocks provisioned automatically when the free list runs dry.
    /// 0 disables automatic growth.
    pub growth_step: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            initial_block_count: 64,
            max_block_count: 256,
            alignment: DEFAULT_ALIGNMENT,
            metrics_enabled: true,
            growth_step: 0,
        }
    }
}

impl PoolConfig {
    /// Create a config with explicit sizes and default alignment/metrics
    pub fn new(block_size: usize, initial_block_count: usize, max_block_count: usize) -> Self {
        Self {
            block_size,
            initial_block_count,
            max_block_count,
            ..Default::default()
        }
    }

    /// Set the alignment
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Enable or disable metrics bookkeeping
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Set the automatic growth step (0 disables)
    pub fn with_growth_step(mut self, blocks: usize) -> Self {
        self.growth_step = blocks;
        self
    }

    /// Check every invariant; `initialize` refuses configs that fail this
    pub fn validate(&self) -> PoolResult<()> {
        if self.block_size == 0 {
            return Err(PoolError::ZeroBlockSize);
        }
        if self.initial_block_count == 0 {
            return Err(PoolError::ZeroInitialBlocks);
        }
        if self.max_block_count < self.initial_block_count {
            return Err(PoolError::MaxBelowInitial {
                initial: self.initial_block_count,
                max: self.max_block_count,
            });
        }
        if !self.alignment.is_power_of_two() {
            return Err(PoolError::AlignmentNotPowerOfTwo(self.alignment));
        }
        if self.max_block_count > MAX_BLOCKS {
            return Err(PoolError::TooManyBlocks {
                requested: self.max_block_count,
                limit: MAX_BLOCKS,
            });
        }
        self.region_bytes()?;
        Ok(())
    }

    /// Alignment actually used for the layout
    #[inline]
    pub fn layout_alignment(&self) -> usize {
        self.alignment.max(MIN_ALIGNMENT)
    }

    /// Distance in bytes between consecutive blocks
    ///
    /// `block_size` rounded up to the layout alignment, so every block start
    /// inherits the region's alignment.
    pub fn stride(&self) -> Option<usize> {
        let align = self.layout_alignment();
        self.block_size
            .checked_add(align - 1)
            .map(|size| size & !(align - 1))
    }

    /// Total bytes reserved for the region
    pub fn region_bytes(&self) -> PoolResult<usize> {
        let too_large = PoolError::RegionTooLarge {
            block_size: self.block_size,
            blocks: self.max_block_count,
        };
        let bytes = self
            .stride()
            .and_then(|stride| stride.checked_mul(self.max_block_count))
            .ok_or_else(|| too_large.clone())?;
        // Layout requires size + align to stay below isize::MAX
        if bytes > isize::MAX as usize - self.layout_alignment() {
            return Err(too_large);
        }
        Ok(bytes)
    }
}
