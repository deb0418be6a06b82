use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, PoisonError},
};

use lattice_types::{BlockHash, BlockNumber, StreamId, EMPTY_HASH};

/// Hash responses from several streams over one fixed window of heights.
///
/// Each stream contributes one full-length response; from those the longest
/// hash chain carried by a strict majority is derived. Workers record
/// results concurrently, so the position table sits behind a lock.
#[derive(Debug)]
pub(crate) struct HashChainResults {
    bns: Vec<BlockNumber>,
    /// One `stream -> hash` table per window position.
    results: Mutex<Vec<HashMap<StreamId, BlockHash>>>,
}

impl HashChainResults {
    /// Creates an empty result set for the window `bns`.
    pub(crate) fn new(bns: Vec<BlockNumber>) -> Self {
        let results = Mutex::new(vec![HashMap::new(); bns.len()]);
        Self { bns, results }
    }

    /// The heights of the window.
    pub(crate) fn block_numbers(&self) -> &[BlockNumber] {
        &self.bns
    }

    /// Records one stream's response. `hashes` must have one entry per
    /// window position; short or long responses are rejected before this
    /// point. Empty hashes mean the peer does not know the height and are
    /// not recorded.
    pub(crate) fn add_result(&self, hashes: &[BlockHash], stream_id: StreamId) {
        debug_assert_eq!(hashes.len(), self.bns.len());

        let mut results = self.lock();
        for (table, hash) in results.iter_mut().zip(hashes) {
            if *hash != EMPTY_HASH {
                table.insert(stream_id.clone(), *hash);
            }
        }
    }

    /// The number of window positions with at least one response, for
    /// diagnostics when the cycle expires before a chain was derived.
    pub(crate) fn num_blocks_with_results(&self) -> usize {
        self.lock().iter().filter(|table| !table.is_empty()).count()
    }

    /// Derives the longest hash chain a strict majority of streams agrees
    /// on, together with the streams whose responses carry that chain as a
    /// prefix.
    ///
    /// Position 0 needs strictly more than half of all responders behind one
    /// hash; every later position needs strictly more than half of the
    /// streams that agreed on the chain so far. A tie or an absent majority
    /// ends the chain there. The whitelist comes back in stream-id order, so
    /// the result does not depend on response arrival order.
    pub(crate) fn compute_longest_hash_chain(&self) -> (Vec<BlockHash>, Vec<StreamId>) {
        let results = self.lock();

        let mut candidates: BTreeSet<StreamId> = results
            .first()
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        let mut chain = Vec::new();

        for table in results.iter() {
            let Some(hash) = majority_hash(table, &candidates) else {
                break;
            };
            chain.push(hash);
            candidates.retain(|stream_id| table.get(stream_id) == Some(&hash));
        }

        if chain.is_empty() {
            return (Vec::new(), Vec::new());
        }
        (chain, candidates.into_iter().collect())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HashMap<StreamId, BlockHash>>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The hash strictly more than half of `candidates` report in `table`, if
/// any. At most one hash can clear that bar, so ties resolve to `None` by
/// construction.
fn majority_hash(
    table: &HashMap<StreamId, BlockHash>,
    candidates: &BTreeSet<StreamId>,
) -> Option<BlockHash> {
    let mut counts: HashMap<BlockHash, usize> = HashMap::new();
    for stream_id in candidates {
        if let Some(hash) = table.get(stream_id) {
            *counts.entry(*hash).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .find(|(_, count)| count * 2 > candidates.len())
        .map(|(hash, _)| hash)
}
