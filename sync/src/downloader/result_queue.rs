use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
};

use lattice_types::{Block, BlockNumber, StreamId};

/// A downloaded block together with the stream that served it.
#[derive(Debug, Clone)]
pub struct BlockResult {
    /// The block.
    pub block: Block,
    /// The stream the block came from.
    pub stream_id: StreamId,
}

impl BlockResult {
    /// The height of the contained block.
    pub fn number(&self) -> BlockNumber {
        self.block.number()
    }
}

/// A [`BlockResult`] in the result queue.
///
/// The [`Eq`] and [`Ord`] impls only look at the height: the queue holds at
/// most one entry per height, and the ordering is reversed so the lowest
/// height surfaces first in a [`BinaryHeap`].
#[derive(Debug, Clone)]
struct QueuedResult(BlockResult);

impl Eq for QueuedResult {}

impl PartialEq<Self> for QueuedResult {
    fn eq(&self, other: &Self) -> bool {
        self.0.number().eq(&other.0.number())
    }
}

impl PartialOrd<Self> for QueuedResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedResult {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.number().cmp(&other.0.number()).reverse()
    }
}

/// The queue of received blocks waiting to be inserted into the chain.
///
/// Keyed by height; the consumer only ever takes a contiguous ascending run
/// starting at the height it expects next.
#[derive(Debug)]
pub(crate) struct ResultQueue {
    heap: BinaryHeap<QueuedResult>,
    /// The heights currently in `heap`, enforcing one entry per height.
    heights: HashSet<BlockNumber>,
}

impl ResultQueue {
    /// Creates an empty queue.
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            heights: HashSet::new(),
        }
    }

    /// Queues the given blocks under `stream_id`.
    ///
    /// Blocks whose height is already queued are dropped, the first writer
    /// wins.
    pub(crate) fn add_block_results(
        &mut self,
        blocks: impl IntoIterator<Item = Block>,
        stream_id: &StreamId,
    ) {
        for block in blocks {
            if self.heights.insert(block.number()) {
                self.heap.push(QueuedResult(BlockResult {
                    block,
                    stream_id: stream_id.clone(),
                }));
            }
        }
    }

    /// Pops the contiguous ascending run `exp_height, exp_height + 1, …`, at
    /// most `cap` entries.
    ///
    /// Entries below `exp_height` are already part of the chain; they are
    /// discarded first and their heights returned as the second element.
    pub(crate) fn pop_block_results(
        &mut self,
        exp_height: BlockNumber,
        cap: usize,
    ) -> (Vec<BlockResult>, Vec<BlockNumber>) {
        let mut stale = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.0.number() >= exp_height {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry is poppable");
            self.heights.remove(&entry.0.number());
            stale.push(entry.0.number());
        }

        let mut results = Vec::new();
        while results.len() < cap {
            let expected = exp_height + results.len() as u64;
            match self.heap.peek() {
                Some(top) if top.0.number() == expected => {
                    let entry = self.heap.pop().expect("peeked entry is poppable");
                    self.heights.remove(&entry.0.number());
                    results.push(entry.0);
                }
                _ => break,
            }
        }

        (results, stale)
    }

    /// Removes every queued entry that came from `stream_id`, returning the
    /// removed heights. O(n).
    pub(crate) fn remove_results_by_stream_id(&mut self, stream_id: &StreamId) -> Vec<BlockNumber> {
        let mut removed = Vec::new();
        let heights = &mut self.heights;
        self.heap.retain(|entry| {
            if entry.0.stream_id == *stream_id {
                heights.remove(&entry.0.number());
                removed.push(entry.0.number());
                false
            } else {
                true
            }
        });
        removed
    }

    /// The number of queued entries.
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
