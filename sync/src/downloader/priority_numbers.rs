use std::{cmp::Reverse, collections::BinaryHeap};

use lattice_types::BlockNumber;

/// The retry queue: an ordered multiset of block heights where the lowest
/// outstanding height is always handed out first.
///
/// Pushing a height that is already queued is legal; the duplicate is
/// collapsed by the download manager when the popped height turns out to be
/// tracked already.
#[derive(Debug)]
pub(crate) struct PrioritizedNumbers {
    heap: BinaryHeap<Reverse<BlockNumber>>,
}

impl PrioritizedNumbers {
    /// Creates an empty set.
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Queues a height.
    pub(crate) fn push(&mut self, bn: BlockNumber) {
        self.heap.push(Reverse(bn));
    }

    /// Removes and returns the smallest queued height.
    pub(crate) fn pop(&mut self) -> Option<BlockNumber> {
        self.heap.pop().map(|Reverse(bn)| bn)
    }

    /// The number of queued heights, duplicates included.
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
