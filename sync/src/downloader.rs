//! # Block Downloader
//!
//! The long-range bulk fetch: a [`DownloadManager`] tracks which heights are
//! requested, received, or failed while a set of request workers and one
//! inserter drive the chain head towards the cycle target. A cycle is
//! started with [`download_blocks`].
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::Notify,
    task::JoinSet,
    time::{interval, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use lattice_types::{Block, BlockNumber, StreamId};

use crate::{
    chain::{blame_all_streams, Chain},
    config::SyncConfig,
    constants::{
        BLOCKS_BY_NUMBER_REQUEST_TIMEOUT, CYCLE_TICK_INTERVAL, INSERTER_IDLE_BACKOFF,
        STREAM_SHORTAGE_GRACE, WORKER_IDLE_BACKOFF,
    },
    error::SyncError,
    streams::{RequestErrorKind, StreamPool, StreamRequestError},
};

mod priority_numbers;
mod result_queue;

use priority_numbers::PrioritizedNumbers;
pub use result_queue::BlockResult;
use result_queue::ResultQueue;

/// Provenance of a received block, used for blaming when the chain later
/// rejects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDetails {
    /// The worker loop that fetched the block.
    pub loop_id: usize,
    /// The stream that served the block.
    pub stream_id: StreamId,
}

/// Tracking state owned by the [`DownloadManager`] lock.
///
/// Every height in `(head, target]` is in at most one of `requesting`,
/// `processing`, or `retries`; heights in none of them have not been touched
/// yet. Entries in the retry heap that are also tracked elsewhere are stale
/// duplicates and are collapsed when popped.
#[derive(Debug)]
struct DownloadManagerInner {
    /// Heights dispatched to a worker, response pending.
    requesting: HashSet<BlockNumber>,
    /// Heights received and queued, not yet inserted.
    processing: HashSet<BlockNumber>,
    /// Heights that need to be re-requested, lowest first.
    retries: PrioritizedNumbers,
    /// Received blocks waiting for their turn to be inserted.
    rq: ResultQueue,
    /// Provenance of every height in `processing`.
    details: HashMap<BlockNumber, DownloadDetails>,
}

impl DownloadManagerInner {
    fn new() -> Self {
        Self {
            requesting: HashSet::new(),
            processing: HashSet::new(),
            retries: PrioritizedNumbers::new(),
            rq: ResultQueue::new(),
            details: HashMap::new(),
        }
    }

    /// Drains the retry queue into a request batch, at most `cap` heights,
    /// marking each as requesting.
    ///
    /// Heights at or below the current head are already on the chain, and
    /// heights tracked as requesting or processing are duplicate pushes;
    /// both are dropped on the floor.
    fn batch_from_retries(&mut self, cap: usize, current: BlockNumber) -> Vec<BlockNumber> {
        let mut bns = Vec::new();
        while bns.len() < cap {
            match self.retries.pop() {
                None => break,
                Some(bn) if bn <= current => continue,
                Some(bn) if self.processing.contains(&bn) => continue,
                Some(bn) => {
                    if self.requesting.insert(bn) {
                        bns.push(bn);
                    }
                }
            }
        }
        bns
    }

    /// Extends a request batch with heights that were never requested,
    /// scanning upward from the current head and marking each as requesting.
    fn batch_from_unprocessed(
        &mut self,
        cap: usize,
        current: BlockNumber,
        target: BlockNumber,
    ) -> Vec<BlockNumber> {
        let mut bns = Vec::with_capacity(cap);
        let mut bn = current + 1;
        while bns.len() < cap && bn <= target {
            if !self.requesting.contains(&bn) && !self.processing.contains(&bn) {
                self.requesting.insert(bn);
                bns.push(bn);
            }
            bn += 1;
        }
        bns
    }
}

/// The state machine coordinating requesting, processing, and retries for a
/// long-range bulk fetch.
///
/// All methods are callable from any task; the internal lock is only held
/// for short set and heap operations, never across I/O.
pub struct DownloadManager<C> {
    chain: Arc<C>,
    target: BlockNumber,
    blocks_per_request: usize,
    soft_queue_cap: usize,
    inner: Mutex<DownloadManagerInner>,
    /// Edge-triggered signal that new results arrived. Senders never block,
    /// receivers re-check state under the lock after waking.
    result_signal: Notify,
}

impl<C: Chain> DownloadManager<C> {
    /// Creates a manager for one cycle targeting `target`.
    pub fn new(chain: Arc<C>, target: BlockNumber, config: &SyncConfig) -> Self {
        Self {
            chain,
            target,
            blocks_per_request: config.blocks_per_request,
            soft_queue_cap: config.soft_queue_cap,
            inner: Mutex::new(DownloadManagerInner::new()),
            result_signal: Notify::new(),
        }
    }

    /// The height this cycle is syncing towards.
    pub fn target(&self) -> BlockNumber {
        self.target
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DownloadManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assembles the next batch of heights to request: retries first, then,
    /// if the result queue has room, heights that were never requested.
    ///
    /// Every returned height is tracked as requesting. An empty batch means
    /// there is nothing to do right now; callers should wait on
    /// [`Self::wait_for_result`] before asking again.
    pub fn get_next_batch(&self) -> Vec<BlockNumber> {
        let mut inner = self.lock();
        let current = self.chain.current_number();

        let mut bns = inner.batch_from_retries(self.blocks_per_request, current);

        if bns.len() < self.blocks_per_request && inner.rq.len() < self.soft_queue_cap {
            let fresh = inner.batch_from_unprocessed(
                self.blocks_per_request - bns.len(),
                current,
                self.target,
            );
            bns.extend(fresh);
        }
        bns
    }

    /// Records the outcome of a get-blocks-by-number request.
    ///
    /// Heights whose slot came back empty go to the retry queue, the rest
    /// move to processing and their blocks into the result queue.
    pub fn handle_request_result(
        &self,
        bns: &[BlockNumber],
        blocks: Vec<Option<Block>>,
        loop_id: usize,
        stream_id: &StreamId,
    ) {
        debug_assert_eq!(bns.len(), blocks.len());

        let mut inner = self.lock();
        for (bn, block) in bns.iter().zip(&blocks) {
            inner.requesting.remove(bn);
            if block.is_some() {
                inner.processing.insert(*bn);
                inner.details.insert(
                    *bn,
                    DownloadDetails {
                        loop_id,
                        stream_id: stream_id.clone(),
                    },
                );
            } else {
                inner.retries.push(*bn);
            }
        }
        inner
            .rq
            .add_block_results(blocks.into_iter().flatten(), stream_id);
        drop(inner);

        self.result_signal.notify_one();
    }

    /// Records a failed get-blocks-by-number request.
    ///
    /// The requested heights go back to the retry queue. If the failing
    /// stream is known, every result it previously delivered is scrubbed
    /// from the result queue and retried too; the returned id should then be
    /// passed to [`StreamPool::remove_stream`] by the caller.
    pub fn handle_request_error(
        &self,
        bns: &[BlockNumber],
        err: &StreamRequestError,
    ) -> Option<StreamId> {
        let mut inner = self.lock();
        for bn in bns {
            inner.requesting.remove(bn);
            inner.retries.push(*bn);
        }
        tracing::warn!(
            %err,
            stream = ?err.stream_id,
            retries = inner.retries.len(),
            "get blocks request failed",
        );

        let stream_id = err.stream_id.clone()?;
        let removed = inner.rq.remove_results_by_stream_id(&stream_id);
        for bn in removed {
            inner.processing.remove(&bn);
            inner.details.remove(&bn);
            inner.retries.push(bn);
        }
        Some(stream_id)
    }

    /// Pops the run of blocks starting right above the current head, at most
    /// `cap` of them.
    pub fn pull_continuous_blocks(&self, cap: usize) -> Vec<BlockResult> {
        let mut inner = self.lock();
        let exp_height = self.chain.current_number() + 1;
        let (results, stale) = inner.rq.pop_block_results(exp_height, cap);
        for bn in stale {
            inner.processing.remove(&bn);
            inner.details.remove(&bn);
        }
        results
    }

    /// Records blocks the chain accepted.
    pub fn handle_insert_result(&self, inserted: &[BlockResult]) {
        let mut inner = self.lock();
        for result in inserted {
            inner.processing.remove(&result.number());
            inner.details.remove(&result.number());
        }
    }

    /// Records a failed insert: `results[..n]` made it onto the chain,
    /// `results[n]` is the offender, and everything after it is re-queued
    /// for another attempt through a clean stream.
    ///
    /// With `blame` set, the offender's stream is scrubbed like in
    /// [`Self::handle_request_error`] and returned for eviction. Without it
    /// (the tail-of-chain missing-signature case) only the offending height
    /// is retried.
    pub fn handle_insert_error(
        &self,
        results: &[BlockResult],
        n: usize,
        blame: bool,
    ) -> Option<StreamId> {
        let (inserted, rest) = results.split_at(n);
        let (offender, abandoned) = rest.split_first().expect("insert failures name an offender");

        let mut inner = self.lock();
        for result in inserted {
            inner.processing.remove(&result.number());
            inner.details.remove(&result.number());
        }

        // The abandoned tail is still tracked as processing; putting it back
        // in the queue lets the inserter pick it up once the gap is refilled.
        for result in abandoned {
            inner
                .rq
                .add_block_results([result.block.clone()], &result.stream_id);
        }

        let bn = offender.number();
        inner.processing.remove(&bn);
        inner.details.remove(&bn);
        inner.retries.push(bn);

        if !blame {
            return None;
        }

        let removed = inner.rq.remove_results_by_stream_id(&offender.stream_id);
        for bn in removed {
            inner.processing.remove(&bn);
            inner.details.remove(&bn);
            inner.retries.push(bn);
        }
        Some(offender.stream_id.clone())
    }

    /// Provenance of a height that is currently processing.
    pub fn download_details(&self, bn: BlockNumber) -> Option<DownloadDetails> {
        self.lock().details.get(&bn).cloned()
    }

    /// Waits until new results are signalled, or at most `max`.
    ///
    /// Wake-ups are advisory; callers re-check the manager state afterwards.
    pub async fn wait_for_result(&self, max: Duration) {
        let _ = timeout(max, self.result_signal.notified()).await;
    }

    #[cfg(test)]
    fn tracked_sets(&self) -> (HashSet<BlockNumber>, HashSet<BlockNumber>, usize) {
        let inner = self.lock();
        (
            inner.requesting.clone(),
            inner.processing.clone(),
            inner.rq.len(),
        )
    }
}

/// Runs one long-range download cycle: brings the chain head from wherever
/// it is up to `target_bn` (capped by `max_blocks_per_cycle`).
///
/// Returns the number of blocks added to the chain. The error is only
/// non-recoverable causes: cancellation, a failed prerequisite, or a
/// sustained stream shortage.
pub async fn download_blocks<S: StreamPool, C: Chain>(
    streams: Arc<S>,
    chain: Arc<C>,
    target_bn: BlockNumber,
    config: &SyncConfig,
    token: &CancellationToken,
) -> Result<u64, SyncError> {
    config.validate()?;

    // Fewer streams than workers is fine, requests just queue at the pool;
    // fewer than the cycle minimum is not.
    let have = streams.num_streams();
    if have < config.min_streams {
        return Err(SyncError::NotEnoughStreams {
            have,
            need: config.min_streams,
        });
    }

    let start = chain.current_number();
    let mut target = target_bn;
    if config.max_blocks_per_cycle > 0 {
        target = target.min(start + config.max_blocks_per_cycle);
    }
    if target <= start {
        return Ok(0);
    }

    tracing::info!(
        start,
        target,
        shard = chain.shard_id(),
        "starting block download cycle",
    );

    let manager = Arc::new(DownloadManager::new(chain.clone(), target, config));
    let cycle = token.child_token();

    let mut tasks = JoinSet::new();
    for loop_id in 0..config.concurrency {
        tasks.spawn(
            block_worker(
                loop_id,
                manager.clone(),
                streams.clone(),
                chain.clone(),
                cycle.clone(),
            )
            .instrument(tracing::debug_span!("block_worker", loop_id)),
        );
    }
    tasks.spawn(
        block_inserter(
            manager.clone(),
            streams.clone(),
            chain.clone(),
            config.insert_batch_size,
            cycle.clone(),
        )
        .instrument(tracing::debug_span!("block_inserter")),
    );

    let mut ticker = interval(CYCLE_TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shortage_limit =
        (STREAM_SHORTAGE_GRACE.as_millis() / CYCLE_TICK_INTERVAL.as_millis()).max(1) as u32;
    let mut shortage_ticks = 0_u32;

    let outcome = loop {
        tokio::select! {
            () = token.cancelled() => break Err(SyncError::Cancelled),
            _ = ticker.tick() => {
                if chain.current_number() >= target {
                    break Ok(());
                }
                if streams.num_streams() < config.min_streams {
                    shortage_ticks += 1;
                    if shortage_ticks >= shortage_limit {
                        break Err(SyncError::StreamShortage { min: config.min_streams });
                    }
                } else {
                    shortage_ticks = 0;
                }
            }
        }
    };

    cycle.cancel();
    while tasks.join_next().await.is_some() {}

    let added = chain.current_number().saturating_sub(start);
    match &outcome {
        Ok(()) => tracing::info!(added, "block download cycle finished"),
        Err(e) => tracing::info!(added, %e, "block download cycle stopped early"),
    }
    outcome.map(|()| added)
}

/// Checks a get-blocks-by-number response against the batch it answers.
fn validate_blocks_response(
    bns: &[BlockNumber],
    blocks: &[Option<Block>],
) -> Result<(), &'static str> {
    if blocks.len() != bns.len() {
        return Err("response length does not match the request");
    }
    for (bn, block) in bns.iter().zip(blocks) {
        if block.as_ref().is_some_and(|b| b.number() != *bn) {
            return Err("block height does not match the requested height");
        }
    }
    Ok(())
}

/// One request worker: pulls batches of heights from the manager and asks
/// the stream pool for them until the cycle target is reached or the cycle
/// is cancelled.
async fn block_worker<S: StreamPool, C: Chain>(
    loop_id: usize,
    manager: Arc<DownloadManager<C>>,
    streams: Arc<S>,
    chain: Arc<C>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() || chain.current_number() >= manager.target() {
            return;
        }

        let batch = manager.get_next_batch();
        if batch.is_empty() {
            tokio::select! {
                () = token.cancelled() => return,
                () = manager.wait_for_result(WORKER_IDLE_BACKOFF) => {}
            }
            continue;
        }

        let outcome = tokio::select! {
            // The cycle is aborting: leave the in-flight heights alone, the
            // manager state is discarded with the cycle.
            () = token.cancelled() => return,
            res = timeout(
                BLOCKS_BY_NUMBER_REQUEST_TIMEOUT,
                streams.get_blocks_by_number(&batch),
            ) => res,
        };

        match outcome {
            Ok(Ok((blocks, stream_id))) => {
                if let Err(reason) = validate_blocks_response(&batch, &blocks) {
                    let err = StreamRequestError::on_stream(
                        stream_id,
                        RequestErrorKind::InvalidResponse(reason),
                    );
                    if let Some(evict) = manager.handle_request_error(&batch, &err) {
                        streams.remove_stream(&evict);
                    }
                } else {
                    tracing::debug!(
                        blocks = blocks.iter().flatten().count(),
                        requested = batch.len(),
                        stream = %stream_id,
                        "received blocks",
                    );
                    manager.handle_request_result(&batch, blocks, loop_id, &stream_id);
                }
            }
            Ok(Err(err)) => {
                let no_stream = matches!(err.kind, RequestErrorKind::NoAvailableStream);
                if let Some(evict) = manager.handle_request_error(&batch, &err) {
                    streams.remove_stream(&evict);
                }
                // An empty pool clears up on its own or not at all; don't
                // hammer it.
                if no_stream {
                    tokio::select! {
                        () = token.cancelled() => return,
                        () = manager.wait_for_result(WORKER_IDLE_BACKOFF) => {}
                    }
                }
            }
            Err(_elapsed) => {
                let err = StreamRequestError::no_stream(RequestErrorKind::Timeout);
                let _ = manager.handle_request_error(&batch, &err);
            }
        }
    }
}

/// The single inserter: drains contiguous runs from the manager and hands
/// them to the chain, blaming streams for bad blocks.
async fn block_inserter<S: StreamPool, C: Chain>(
    manager: Arc<DownloadManager<C>>,
    streams: Arc<S>,
    chain: Arc<C>,
    insert_batch_size: usize,
    token: CancellationToken,
) {
    loop {
        let results = manager.pull_continuous_blocks(insert_batch_size);
        if results.is_empty() {
            // On cancellation everything contiguously available has been
            // drained at this point.
            if token.is_cancelled() || chain.current_number() >= manager.target() {
                return;
            }
            manager.wait_for_result(INSERTER_IDLE_BACKOFF).await;
            continue;
        }

        let blocks = results.iter().map(|r| r.block.clone()).collect::<Vec<_>>();
        match chain.insert_chain(&blocks) {
            Ok(inserted) => {
                tracing::debug!(
                    inserted,
                    head = chain.current_number(),
                    "inserted contiguous blocks",
                );
                manager.handle_insert_result(&results);
            }
            Err(failure) => {
                let n = failure.inserted;
                let offender = &results[n];
                tracing::warn!(
                    number = offender.number(),
                    stream = %offender.stream_id,
                    details = ?manager.download_details(offender.number()),
                    error = %failure.error,
                    "chain rejected a downloaded block",
                );
                let blame = blame_all_streams(results.len(), n, &failure.error);
                if let Some(evict) = manager.handle_insert_error(&results, n, blame) {
                    streams.remove_stream(&evict);
                }
            }
        }
    }
}
