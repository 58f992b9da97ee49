//! Block pool error types
//!
//! Only setup calls return these. The hot path reports exhaustion and misuse
//! through `Option` and silent no-ops instead.

use thiserror::Error;

/// Errors that can occur while configuring or initializing a pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `block_size` was zero
    #[error("Block size must be greater than zero")]
    ZeroBlockSize,

    /// `initial_block_count` was zero
    #[error("Initial block count must be greater than zero")]
    ZeroInitialBlocks,

    /// `max_block_count` below `initial_block_count`
    #[error("Max block count {max} is below initial block count {initial}")]
    MaxBelowInitial { initial: usize, max: usize },

    /// Alignment is not a power of two
    #[error("Alignment {0} is not a power of two")]
    AlignmentNotPowerOfTwo(usize),

    /// Block indices are 32-bit; the sentinel takes the top value
    #[error("Block count {requested} exceeds the supported maximum {limit}")]
    TooManyBlocks { requested: usize, limit: usize },

    /// `block_size * max_block_count` overflows the address space
    #[error("Pool region of {block_size} x {blocks} bytes does not fit in memory")]
    RegionTooLarge { block_size: usize, blocks: usize },

    /// `initialize` called on a live pool
    #[error("Pool is already initialized; shut it down first")]
    AlreadyInitialized,

    /// The backing allocation failed
    #[error("Failed to allocate {bytes} bytes for the pool region")]
    AllocationFailed { bytes: usize },
}

/// Result type for pool setup operations
pub type PoolResult<T> = Result<T, PoolError>;
