use std::sync::{Mutex, PoisonError};

use lattice_types::{Block, BlockHash, StreamId};

use crate::error::SyncError;

/// One batch of hashes to fetch, with the streams still eligible to serve
/// it.
#[derive(Debug)]
struct HashBatch {
    /// Index range into the manager's hash list.
    start: usize,
    end: usize,
    /// Streams that attested to these hashes and have not failed the batch.
    whitelist: Vec<StreamId>,
    /// Whether a worker currently holds this batch.
    claimed: bool,
    /// Whether the batch's blocks have all been received.
    done: bool,
}

/// Partitions a hash list into fixed-size batches and hands them out to
/// concurrent fetch workers.
///
/// Every hash lives in exactly one batch. A batch is either satisfied in
/// full or retried from scratch against its remaining whitelist; once any
/// batch runs out of eligible streams the whole fetch is failed.
#[derive(Debug)]
pub(crate) struct BlocksByHashManager {
    hashes: Vec<BlockHash>,
    inner: Mutex<BlocksByHashInner>,
}

#[derive(Debug)]
struct BlocksByHashInner {
    batches: Vec<HashBatch>,
    /// Received blocks, positionally aligned with `hashes`.
    blocks: Vec<Option<Block>>,
    /// The stream that served each batch, in batch order.
    sources: Vec<Option<StreamId>>,
}

impl BlocksByHashManager {
    /// Creates a manager fetching `hashes` in batches of `batch_size` from
    /// the streams in `whitelist`.
    pub(crate) fn new(hashes: Vec<BlockHash>, whitelist: Vec<StreamId>, batch_size: usize) -> Self {
        debug_assert!(batch_size > 0);

        let mut batches = Vec::new();
        let mut start = 0;
        while start < hashes.len() {
            let end = (start + batch_size).min(hashes.len());
            batches.push(HashBatch {
                start,
                end,
                whitelist: whitelist.clone(),
                claimed: false,
                done: false,
            });
            start = end;
        }

        let blocks = vec![None; hashes.len()];
        let sources = vec![None; batches.len()];
        Self {
            hashes,
            inner: Mutex::new(BlocksByHashInner {
                batches,
                blocks,
                sources,
            }),
        }
    }

    /// The number of batches, which bounds how many workers can be busy.
    pub(crate) fn num_requests(&self) -> usize {
        self.lock().batches.len()
    }

    /// Whether every hash has its block.
    pub(crate) fn is_done(&self) -> bool {
        self.lock().batches.iter().all(|batch| batch.done)
    }

    /// Claims the next unfinished, unclaimed batch.
    ///
    /// `Ok(None)` means every open batch is currently claimed by some other
    /// worker; the caller should back off briefly and ask again. An
    /// unfinished batch with an empty whitelist fails the whole fetch.
    pub(crate) fn next_batch(
        &self,
    ) -> Result<Option<(usize, Vec<BlockHash>, Vec<StreamId>)>, SyncError> {
        let mut inner = self.lock();
        for (index, batch) in inner.batches.iter_mut().enumerate() {
            if batch.done || batch.claimed {
                continue;
            }
            if batch.whitelist.is_empty() {
                return Err(SyncError::WhitelistExhausted);
            }
            batch.claimed = true;
            let hashes = self.hashes[batch.start..batch.end].to_vec();
            return Ok(Some((index, hashes, batch.whitelist.clone())));
        }
        Ok(None)
    }

    /// Returns a claimed batch after a failed request. If the failing stream
    /// is known it becomes ineligible for this batch.
    pub(crate) fn handle_result_error(&self, index: usize, stream_id: Option<&StreamId>) {
        let mut inner = self.lock();
        let batch = &mut inner.batches[index];
        batch.claimed = false;
        if let Some(stream_id) = stream_id {
            batch.whitelist.retain(|candidate| candidate != stream_id);
        }
    }

    /// Stores the blocks of a fully served batch.
    pub(crate) fn add_result(&self, index: usize, blocks: Vec<Block>, stream_id: StreamId) {
        let mut inner = self.lock();
        let (start, end) = {
            let batch = &mut inner.batches[index];
            debug_assert_eq!(blocks.len(), batch.end - batch.start);
            batch.claimed = false;
            batch.done = true;
            (batch.start, batch.end)
        };
        for (slot, block) in inner.blocks[start..end].iter_mut().zip(blocks) {
            *slot = Some(block);
        }
        inner.sources[index] = Some(stream_id);
    }

    /// The fetched blocks, aligned with the input hashes, and the streams
    /// that served them in batch order.
    pub(crate) fn results(&self) -> Result<(Vec<Block>, Vec<StreamId>), SyncError> {
        let mut inner = self.lock();

        if inner.blocks.iter().any(Option::is_none) {
            return Err(SyncError::WhitelistExhausted);
        }

        let blocks = inner.blocks.drain(..).map(Option::unwrap).collect();
        let mut sources: Vec<StreamId> = Vec::new();
        for stream_id in inner.sources.drain(..).flatten() {
            if !sources.contains(&stream_id) {
                sources.push(stream_id);
            }
        }
        Ok((blocks, sources))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BlocksByHashInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
