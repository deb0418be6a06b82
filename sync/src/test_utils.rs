//! Test fakes for the [`StreamPool`] and [`Chain`] seams.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Semaphore, time::sleep};

use lattice_types::{Block, BlockHash, BlockHeader, BlockNumber, StreamId, EMPTY_HASH};

use crate::{
    chain::{Chain, ChainError, ChainInsertFailure},
    streams::{RequestErrorKind, StreamPool, StreamRequestError},
};

/// Builds a linked canonical chain of `len` blocks, genesis at height 0,
/// every block signed.
pub(crate) fn make_chain(len: usize) -> Vec<Block> {
    let mut chain: Vec<Block> = Vec::with_capacity(len);
    for number in 0..len as u64 {
        let parent_hash = chain.last().map_or(EMPTY_HASH, Block::hash);
        chain.push(Block {
            header: BlockHeader {
                number,
                parent_hash,
                shard_id: 0,
                timestamp: 1_700_000_000 + number,
            },
            signature: Some([7; 96]),
            payload: number.to_le_bytes().to_vec(),
        });
    }
    chain
}

/// An in-memory chain that verifies linkage and signatures on insert.
pub(crate) struct MockChain {
    blocks: Mutex<Vec<Block>>,
    /// Heights of each successfully inserted run, in call order.
    inserted_runs: Mutex<Vec<Vec<BlockNumber>>>,
    fail_once_at: Mutex<Option<(BlockNumber, ChainError)>>,
    shard_id: u32,
    beacon_shard_id: u32,
}

impl MockChain {
    /// A chain whose head is `prefix.last()`.
    pub(crate) fn new(prefix: Vec<Block>) -> Arc<Self> {
        assert!(!prefix.is_empty(), "a chain starts at genesis");
        Arc::new(Self {
            blocks: Mutex::new(prefix),
            inserted_runs: Mutex::new(Vec::new()),
            fail_once_at: Mutex::new(None),
            shard_id: 0,
            beacon_shard_id: 0,
        })
    }

    /// Makes the next insert of height `bn` fail with `error`, once.
    pub(crate) fn fail_once_at(&self, bn: BlockNumber, error: ChainError) {
        *self.lock_fail() = Some((bn, error));
    }

    /// The heights of every successful insert call so far.
    pub(crate) fn inserted_runs(&self) -> Vec<Vec<BlockNumber>> {
        self.inserted_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_blocks(&self) -> std::sync::MutexGuard<'_, Vec<Block>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_fail(&self) -> std::sync::MutexGuard<'_, Option<(BlockNumber, ChainError)>> {
        self.fail_once_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Chain for MockChain {
    fn current_block(&self) -> Block {
        self.lock_blocks().last().expect("never empty").clone()
    }

    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    fn beacon_shard_id(&self) -> u32 {
        self.beacon_shard_id
    }

    fn insert_chain(&self, blocks: &[Block]) -> Result<usize, ChainInsertFailure> {
        let mut chain = self.lock_blocks();
        let mut run = Vec::with_capacity(blocks.len());

        let failure = |inserted: usize, error: ChainError| ChainInsertFailure { inserted, error };

        for (i, block) in blocks.iter().enumerate() {
            if let Some((_, error)) = self.lock_fail().take_if(|(bn, _)| *bn == block.number()) {
                self.record_run(run);
                return Err(failure(i, error));
            }

            let head = chain.last().expect("never empty");
            if block.number() != head.number() + 1 {
                self.record_run(run);
                return Err(failure(i, ChainError::NotSequential));
            }
            if block.parent_hash() != head.hash() {
                self.record_run(run);
                return Err(failure(
                    i,
                    ChainError::Verification("parent hash mismatch".into()),
                ));
            }
            if block.signature.is_none() {
                self.record_run(run);
                return Err(failure(i, ChainError::MissingSignature));
            }

            chain.push(block.clone());
            run.push(block.number());
        }

        self.record_run(run);
        Ok(blocks.len())
    }
}

impl MockChain {
    fn record_run(&self, run: Vec<BlockNumber>) {
        if !run.is_empty() {
            self.inserted_runs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(run);
        }
    }
}

/// How a mock peer answers requests.
#[derive(Debug, Clone)]
pub(crate) enum PeerBehavior {
    /// Serves the canonical chain faithfully.
    Truthful,
    /// Claims not to have the given heights in by-number responses.
    MissingHeights(HashSet<BlockNumber>),
    /// Fails every request.
    Erroring,
    /// Reports a bogus hash at the given window position.
    HashLiar { position: usize },
    /// Serves by-hash requests with blocks that hash to something else.
    CorruptBodies,
    /// Serves by-number requests with blocks whose parent link is broken.
    CorruptParents,
}

struct MockPeer {
    id: StreamId,
    behavior: PeerBehavior,
    /// One request in flight per stream, like the real pool.
    gate: Arc<Semaphore>,
}

/// An in-memory stream pool serving a canonical chain through a set of
/// peers with configurable behaviours. Requests are spread round-robin over
/// the eligible peers.
pub(crate) struct MockStreamPool {
    canonical: Arc<Vec<Block>>,
    peers: Vec<MockPeer>,
    removed: Mutex<HashSet<StreamId>>,
    round_robin: AtomicUsize,
    in_flight: AtomicUsize,
    /// High-water mark of concurrent requests, across all peers.
    pub(crate) max_in_flight: AtomicUsize,
    serve_delay: Duration,
}

impl MockStreamPool {
    pub(crate) fn new(canonical: Arc<Vec<Block>>) -> Self {
        Self {
            canonical,
            peers: Vec::new(),
            removed: Mutex::new(HashSet::new()),
            round_robin: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            serve_delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_peer(mut self, id: &str, behavior: PeerBehavior) -> Self {
        self.peers.push(MockPeer {
            id: StreamId::from(id),
            behavior,
            gate: Arc::new(Semaphore::new(1)),
        });
        self
    }

    /// Adds a per-request delay so tests can observe request overlap.
    pub(crate) fn with_serve_delay(mut self, delay: Duration) -> Self {
        self.serve_delay = delay;
        self
    }

    pub(crate) fn is_removed(&self, id: &str) -> bool {
        self.lock_removed().contains(&StreamId::from(id))
    }

    fn lock_removed(&self) -> std::sync::MutexGuard<'_, HashSet<StreamId>> {
        self.removed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pick(&self, whitelist: Option<&[StreamId]>) -> Option<&MockPeer> {
        let removed = self.lock_removed();
        let eligible: Vec<&MockPeer> = self
            .peers
            .iter()
            .filter(|peer| !removed.contains(&peer.id))
            .filter(|peer| whitelist.is_none_or(|wl| wl.contains(&peer.id)))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index])
    }

    fn canonical_by_hash(&self) -> HashMap<BlockHash, &Block> {
        self.canonical.iter().map(|b| (b.hash(), b)).collect()
    }

    async fn enter<'a>(&self, peer: &'a MockPeer) -> tokio::sync::SemaphorePermit<'a> {
        let permit = peer.gate.acquire().await.expect("gate never closed");
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.serve_delay.is_zero() {
            sleep(self.serve_delay).await;
        }
        permit
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamPool for MockStreamPool {
    fn num_streams(&self) -> usize {
        let removed = self.lock_removed();
        self.peers
            .iter()
            .filter(|peer| !removed.contains(&peer.id))
            .count()
    }

    async fn get_block_hashes(
        &self,
        bns: &[BlockNumber],
    ) -> Result<(Vec<BlockHash>, StreamId), StreamRequestError> {
        let peer = self
            .pick(None)
            .ok_or_else(|| StreamRequestError::no_stream(RequestErrorKind::NoAvailableStream))?;
        let permit = self.enter(peer).await;

        let result = match &peer.behavior {
            PeerBehavior::Erroring => Err(StreamRequestError::on_stream(
                peer.id.clone(),
                RequestErrorKind::StreamClosed,
            )),
            behavior => {
                let hashes = bns
                    .iter()
                    .enumerate()
                    .map(|(i, bn)| {
                        if matches!(behavior, PeerBehavior::HashLiar { position } if *position == i)
                        {
                            return [0xde; 32];
                        }
                        self.canonical
                            .get(*bn as usize)
                            .map_or(EMPTY_HASH, Block::hash)
                    })
                    .collect();
                Ok((hashes, peer.id.clone()))
            }
        };

        drop(permit);
        self.leave();
        result
    }

    async fn get_blocks_by_number(
        &self,
        bns: &[BlockNumber],
    ) -> Result<(Vec<Option<Block>>, StreamId), StreamRequestError> {
        let peer = self
            .pick(None)
            .ok_or_else(|| StreamRequestError::no_stream(RequestErrorKind::NoAvailableStream))?;
        let permit = self.enter(peer).await;

        let result = match &peer.behavior {
            PeerBehavior::Erroring => Err(StreamRequestError::on_stream(
                peer.id.clone(),
                RequestErrorKind::StreamClosed,
            )),
            behavior => {
                let blocks = bns
                    .iter()
                    .map(|bn| {
                        if matches!(behavior, PeerBehavior::MissingHeights(missing) if missing.contains(bn))
                        {
                            return None;
                        }
                        let mut block = self.canonical.get(*bn as usize).cloned()?;
                        if matches!(behavior, PeerBehavior::CorruptParents) {
                            block.header.parent_hash = [0xab; 32];
                        }
                        Some(block)
                    })
                    .collect();
                Ok((blocks, peer.id.clone()))
            }
        };

        drop(permit);
        self.leave();
        result
    }

    async fn get_blocks_by_hashes(
        &self,
        hashes: &[BlockHash],
        whitelist: &[StreamId],
    ) -> Result<(Vec<Option<Block>>, StreamId), StreamRequestError> {
        let peer = self
            .pick(Some(whitelist))
            .ok_or_else(|| StreamRequestError::no_stream(RequestErrorKind::NoAvailableStream))?;
        let permit = self.enter(peer).await;

        let result = match &peer.behavior {
            PeerBehavior::Erroring => Err(StreamRequestError::on_stream(
                peer.id.clone(),
                RequestErrorKind::StreamClosed,
            )),
            behavior => {
                let index = self.canonical_by_hash();
                let blocks = hashes
                    .iter()
                    .map(|hash| {
                        let mut block = index.get(hash).map(|b| (*b).clone())?;
                        if matches!(behavior, PeerBehavior::CorruptBodies) {
                            block.header.timestamp += 1;
                        }
                        Some(block)
                    })
                    .collect();
                Ok((blocks, peer.id.clone()))
            }
        };

        drop(permit);
        self.leave();
        result
    }

    fn remove_stream(&self, stream_id: &StreamId) {
        self.lock_removed().insert(stream_id.clone());
    }
}
