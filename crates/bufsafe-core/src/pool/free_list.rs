//! Lock-free free list over block indices
//!
//! A Treiber stack whose nodes are entries of the metadata array. The head is
//! a tagged index: the upper 32 bits hold a generation counter bumped on
//! every successful CAS, the lower 32 bits the index of the top block.
//! A pop that read a stale `next` (the head was popped and pushed back in
//! between) fails its CAS because the generation moved on, so ABA cannot
//! splice a checked-out block back onto the list. Links are indices into a
//! metadata array that outlives every operation, so a racing reader never
//! dereferences freed memory.

use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicU64, Ordering};

use super::block::BlockMeta;

/// End-of-list marker
pub(crate) const NIL: u32 = u32::MAX;

#[inline(always)]
fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline(always)]
fn unpack(tagged: u64) -> (u32, u32) {
    ((tagged >> 32) as u32, tagged as u32)
}

/// Atomic head of the free list, alone on its cache line
pub(crate) struct FreeList {
    head: CachePadded<AtomicU64>,
}

impl FreeList {
    /// A list whose first node is `first` (or empty for `NIL`).
    /// Links between nodes must already be set in the metadata.
    pub(crate) fn with_head(first: u32) -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(pack(0, first))),
        }
    }

    /// Pop the top block. `None` when the list is empty.
    #[inline]
    pub(crate) fn pop(&self, blocks: &[BlockMeta]) -> Option<u32> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (generation, index) = unpack(head);
            if index == NIL {
                return None;
            }
            let node = blocks.get(index as usize)?;
            // May be stale if another thread popped `index` meanwhile; the
            // generation check in the CAS rejects that case.
            let next = node.next.load(Ordering::Acquire);
            match self.head.compare_exchange_weak(
                head,
                pack(generation.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Push a single block
    #[inline]
    pub(crate) fn push(&self, index: u32, blocks: &[BlockMeta]) {
        self.push_chain(index, index, blocks);
    }

    /// Push a pre-linked chain `first -> ... -> last` with one CAS
    pub(crate) fn push_chain(&self, first: u32, last: u32, blocks: &[BlockMeta]) {
        let tail = &blocks[last as usize];
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (generation, top) = unpack(head);
            tail.next.store(top, Ordering::Release);
            match self.head.compare_exchange_weak(
                head,
                pack(generation.wrapping_add(1), first),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Index of the top block, for diagnostics only
    pub(crate) fn peek(&self) -> Option<u32> {
        match unpack(self.head.load(Ordering::Acquire)).1 {
            NIL => None,
            index => Some(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked(count: u32) -> Vec<BlockMeta> {
        (0..count)
            .map(|i| BlockMeta::new(i, if i + 1 < count { i + 1 } else { NIL }))
            .collect()
    }

    #[test]
    fn test_pack_roundtrip_extremes() {
        assert_eq!(unpack(pack(u32::MAX, NIL)), (u32::MAX, NIL));
        assert_eq!(unpack(pack(0, 0)), (0, 0));
    }

    #[test]
    fn test_pop_order_is_lifo() {
        let blocks = linked(3);
        let list = FreeList::with_head(0);

        assert_eq!(list.pop(&blocks), Some(0));
        assert_eq!(list.pop(&blocks), Some(1));

        list.push(0, &blocks);
        assert_eq!(list.peek(), Some(0));
        assert_eq!(list.pop(&blocks), Some(0));
        assert_eq!(list.pop(&blocks), Some(2));
        assert_eq!(list.pop(&blocks), None);
        assert_eq!(list.peek(), None);
    }

    #[test]
    fn test_push_chain_splices_in_front() {
        let blocks = linked(4);
        // List holds only block 3; blocks 0..=2 are a detached chain
        let list = FreeList::with_head(3);
        list.push_chain(0, 2, &blocks);

        let popped: Vec<u32> = std::iter::from_fn(|| list.pop(&blocks)).collect();
        assert_eq!(popped, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_generation_advances_on_every_cas() {
        let blocks = linked(1);
        let list = FreeList::with_head(0);
        let before = unpack(list.head.load(Ordering::Relaxed)).0;
        list.pop(&blocks);
        list.push(0, &blocks);
        let after = unpack(list.head.load(Ordering::Relaxed)).0;
        assert_eq!(after, before.wrapping_add(2));
    }
}
