//! # Short-Range Reconciler
//!
//! When the divergence from the network tip is small it is cheaper to agree
//! on the next few block hashes with a quorum of streams and fetch exactly
//! those bodies than to run the bulk downloader. [`run_short_range_sync`]
//! runs one such round: gather hashes from several streams in parallel, keep
//! the longest chain a strict majority supports, then download the bodies
//! from the streams that attested to it.
use std::sync::Arc;

use tokio::{
    task::JoinSet,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use lattice_types::{Block, BlockHash, BlockNumber, StreamId};

use crate::{
    chain::{blame_all_streams, Chain},
    config::SyncConfig,
    constants::{
        BLOCKS_BY_HASHES_REQUEST_TIMEOUT, BLOCK_HASHES_REQUEST_TIMEOUT, WORKER_IDLE_BACKOFF,
    },
    error::SyncError,
    streams::{RequestErrorKind, StreamPool, StreamRequestError},
};

mod by_hash;
mod hash_chain;

use by_hash::BlocksByHashManager;
use hash_chain::HashChainResults;

/// The two-phase short-range protocol: parallel hash gathering followed by
/// body fetches against the attesting streams.
pub struct ShortRangeHelper<S> {
    streams: Arc<S>,
    config: SyncConfig,
    token: CancellationToken,
}

impl<S: StreamPool> ShortRangeHelper<S> {
    /// Creates a helper for one short-range round.
    pub fn new(streams: Arc<S>, config: SyncConfig, token: CancellationToken) -> Self {
        Self {
            streams,
            config,
            token,
        }
    }

    /// Fails if there are not enough streams for the configured parallelism.
    pub fn check_prerequisites(&self) -> Result<(), SyncError> {
        let have = self.streams.num_streams();
        if have < self.config.concurrency {
            return Err(SyncError::NotEnoughStreams {
                have,
                need: self.config.concurrency,
            });
        }
        Ok(())
    }

    /// The window of heights to reconcile: up to `count` heights right above
    /// `current`, capped by the configured hash window.
    pub fn prepare_block_hash_numbers(
        &self,
        current: BlockNumber,
        count: usize,
    ) -> Vec<BlockNumber> {
        let n = count.min(self.config.block_hashes_per_request) as u64;
        (current + 1..=current + n).collect()
    }

    /// Gathers hash responses for `bns` from `concurrency` streams in
    /// parallel and derives the longest majority-supported chain.
    ///
    /// An empty chain means no strict majority exists for even the first
    /// height; callers treat that as "nothing to reconcile".
    pub async fn get_hash_chain(
        &self,
        bns: Vec<BlockNumber>,
    ) -> Result<(Vec<BlockHash>, Vec<StreamId>), SyncError> {
        let results = Arc::new(HashChainResults::new(bns));

        let mut requests = JoinSet::new();
        for index in 0..self.config.concurrency {
            let streams = Arc::clone(&self.streams);
            let results = Arc::clone(&results);
            requests.spawn(
                async move {
                    let bns = results.block_numbers();
                    match get_block_hashes_request(&*streams, bns).await {
                        Ok((hashes, stream_id)) => {
                            tracing::debug!(
                                stream = %stream_id,
                                hashes = hashes.len(),
                                "received block hashes",
                            );
                            results.add_result(&hashes, stream_id);
                        }
                        Err(err) => {
                            tracing::warn!(%err, stream = ?err.stream_id, "get block hashes failed");
                        }
                    }
                }
                .instrument(tracing::debug_span!("hash_request", index)),
            );
        }
        while requests.join_next().await.is_some() {}

        if self.token.is_cancelled() {
            tracing::info!(
                blocks_with_results = results.num_blocks_with_results(),
                "short range hash gathering cancelled",
            );
            return Err(SyncError::Cancelled);
        }

        let (chain, whitelist) = results.compute_longest_hash_chain();
        tracing::debug!(
            chain = chain.len(),
            whitelist = whitelist.len(),
            "computed longest hash chain",
        );
        Ok((chain, whitelist))
    }

    /// Downloads the bodies for `hashes` from the streams in `whitelist`.
    ///
    /// The hashes are split into fixed-size batches; up to `concurrency`
    /// workers claim and fetch batches until every hash is filled. A stream
    /// that fails or mangles a batch becomes ineligible for it; a batch with
    /// no eligible streams left fails the whole call.
    pub async fn get_blocks_by_hashes(
        &self,
        hashes: Vec<BlockHash>,
        whitelist: Vec<StreamId>,
    ) -> Result<(Vec<Block>, Vec<StreamId>), SyncError> {
        let manager = Arc::new(BlocksByHashManager::new(
            hashes,
            whitelist,
            self.config.blocks_per_hashes_request,
        ));
        let round = self.token.child_token();
        let concurrency = self.config.concurrency.min(manager.num_requests()).max(1);

        let mut workers = JoinSet::new();
        for index in 0..concurrency {
            let streams = Arc::clone(&self.streams);
            let manager = Arc::clone(&manager);
            let round = round.clone();
            workers.spawn(
                async move {
                    let failure = fetch_batches(&*streams, &manager, &round).await;
                    // Terminal conditions wake the sibling workers promptly.
                    round.cancel();
                    failure
                }
                .instrument(tracing::debug_span!("by_hash_worker", index)),
            );
        }

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Ok(Some(err)) = joined {
                failure = Some(err);
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if self.token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        manager.results()
    }

    /// Evicts a set of streams from the pool.
    pub fn remove_streams(&self, stream_ids: &[StreamId]) {
        for stream_id in stream_ids {
            self.streams.remove_stream(stream_id);
        }
    }
}

/// One hash-window request with validation: the response must carry exactly
/// one hash per requested height, otherwise the stream is evicted.
async fn get_block_hashes_request<S: StreamPool>(
    streams: &S,
    bns: &[BlockNumber],
) -> Result<(Vec<BlockHash>, StreamId), StreamRequestError> {
    let (hashes, stream_id) = timeout(
        BLOCK_HASHES_REQUEST_TIMEOUT,
        streams.get_block_hashes(bns),
    )
    .await
    .map_err(|_| StreamRequestError::no_stream(RequestErrorKind::Timeout))??;

    if hashes.len() != bns.len() {
        streams.remove_stream(&stream_id);
        return Err(StreamRequestError::on_stream(
            stream_id,
            RequestErrorKind::InvalidResponse("hash count does not match the request"),
        ));
    }
    Ok((hashes, stream_id))
}

/// The worker loop of [`ShortRangeHelper::get_blocks_by_hashes`]: claim a
/// batch, fetch it, repeat. Returns the error that should fail the whole
/// call, if any.
async fn fetch_batches<S: StreamPool>(
    streams: &S,
    manager: &BlocksByHashManager,
    token: &CancellationToken,
) -> Option<SyncError> {
    loop {
        if manager.is_done() || token.is_cancelled() {
            return None;
        }

        let (index, hashes, whitelist) = match manager.next_batch() {
            Err(err) => return Some(err),
            Ok(None) => {
                tokio::select! {
                    () = token.cancelled() => return None,
                    () = sleep(WORKER_IDLE_BACKOFF) => continue,
                }
            }
            Ok(Some(claim)) => claim,
        };

        match get_blocks_by_hashes_request(streams, &hashes, &whitelist).await {
            Ok((blocks, stream_id)) => {
                tracing::debug!(stream = %stream_id, blocks = blocks.len(), "received block bodies");
                manager.add_result(index, blocks, stream_id);
            }
            Err(err) => {
                tracing::warn!(%err, stream = ?err.stream_id, "get blocks by hashes failed");
                if matches!(err.kind, RequestErrorKind::NoAvailableStream) {
                    // None of the whitelisted streams is left in the pool.
                    return Some(SyncError::WhitelistExhausted);
                }
                manager.handle_result_error(index, err.stream_id.as_ref());
            }
        }
    }
}

/// One get-blocks-by-hashes request with validation: the response must have
/// one block per hash and every block must hash to what was asked for,
/// otherwise the stream is evicted.
async fn get_blocks_by_hashes_request<S: StreamPool>(
    streams: &S,
    hashes: &[BlockHash],
    whitelist: &[StreamId],
) -> Result<(Vec<Block>, StreamId), StreamRequestError> {
    let (blocks, stream_id) = timeout(
        BLOCKS_BY_HASHES_REQUEST_TIMEOUT,
        streams.get_blocks_by_hashes(hashes, whitelist),
    )
    .await
    .map_err(|_| StreamRequestError::no_stream(RequestErrorKind::Timeout))??;

    if let Err(reason) = check_blocks_by_hashes_result(&blocks, hashes) {
        streams.remove_stream(&stream_id);
        return Err(StreamRequestError::on_stream(
            stream_id,
            RequestErrorKind::InvalidResponse(reason),
        ));
    }
    let blocks = blocks.into_iter().flatten().collect();
    Ok((blocks, stream_id))
}

/// Validates a get-blocks-by-hashes response against the requested hashes.
fn check_blocks_by_hashes_result(
    blocks: &[Option<Block>],
    hashes: &[BlockHash],
) -> Result<(), &'static str> {
    if blocks.len() != hashes.len() {
        return Err("block count does not match the request");
    }
    for (block, hash) in blocks.iter().zip(hashes) {
        match block {
            None => return Err("response is missing a requested block"),
            Some(block) if block.hash() != *hash => {
                return Err("block hash does not match the requested hash")
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Runs one short-range reconciliation round against the local chain.
///
/// Returns the number of blocks added. An empty majority chain is not an
/// error, it just means there is nothing the streams agree we are missing.
pub async fn run_short_range_sync<S: StreamPool, C: Chain>(
    streams: Arc<S>,
    chain: Arc<C>,
    config: &SyncConfig,
    token: &CancellationToken,
) -> Result<u64, SyncError> {
    config.validate()?;

    let helper = ShortRangeHelper::new(streams, config.clone(), token.child_token());
    helper.check_prerequisites()?;

    let current = chain.current_number();
    let bns = helper.prepare_block_hash_numbers(current, config.block_hashes_per_request);
    if bns.is_empty() {
        return Ok(0);
    }

    let (hash_chain, whitelist) = helper.get_hash_chain(bns).await?;
    if hash_chain.is_empty() {
        tracing::debug!(current, "no majority hash chain, nothing to reconcile");
        return Ok(0);
    }

    let (blocks, sources) = helper
        .get_blocks_by_hashes(hash_chain, whitelist)
        .await?;

    match chain.insert_chain(&blocks) {
        Ok(inserted) => {
            tracing::info!(inserted, head = chain.current_number(), "short range sync done");
            Ok(inserted as u64)
        }
        Err(failure) => {
            let n = failure.inserted;
            if blame_all_streams(blocks.len(), n, &failure.error) {
                tracing::warn!(
                    number = blocks[n].number(),
                    error = %failure.error,
                    "short range blocks rejected, evicting the attesting streams",
                );
                helper.remove_streams(&sources);
                return Err(SyncError::ChainRejected {
                    number: blocks[n].number(),
                    source: failure.error,
                });
            }
            // The tip block's signature has not been quorumed yet; the next
            // round will fetch it again.
            tracing::debug!(inserted = n, "tail block not signed yet, stopping short");
            Ok(n as u64)
        }
    }
}
