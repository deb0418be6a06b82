//! The seam between the sync core and the local chain.
use lattice_types::{Block, BlockNumber};

/// An error returned by the chain for a single block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The block carries no aggregated quorum signature yet.
    ///
    /// Expected for a block at the network tip whose signature has not been
    /// quorumed, it is retried on a later cycle.
    #[error("block carries no aggregated quorum signature")]
    MissingSignature,
    /// The block does not extend the current head.
    #[error("block does not extend the current head")]
    NotSequential,
    /// The block failed verification.
    #[error("block failed verification: {0}")]
    Verification(String),
}

/// A failed [`Chain::insert_chain`] call.
///
/// The prefix `blocks[..inserted]` was inserted successfully, the block at
/// index `inserted` is the one the chain rejected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("chain insert failed at index {inserted}: {error}")]
pub struct ChainInsertFailure {
    /// The length of the successfully inserted prefix.
    pub inserted: usize,
    /// The error for the offending block.
    #[source]
    pub error: ChainError,
}

/// The local chain, as far as the sync core is concerned.
///
/// Implementations are expected to be cheap for the read accessors; the sync
/// loops call them under short-lived locks. `insert_chain` runs block
/// verification and may block for a while, it is only ever called from the
/// dedicated inserter task.
pub trait Chain: Send + Sync + 'static {
    /// Returns the current head block.
    fn current_block(&self) -> Block;

    /// Returns the height of the current head.
    fn current_number(&self) -> BlockNumber {
        self.current_block().number()
    }

    /// The shard this chain belongs to.
    fn shard_id(&self) -> u32;

    /// The shard id of the beacon chain.
    fn beacon_shard_id(&self) -> u32;

    /// Verifies and inserts `blocks`, which must be in ascending, gap-free
    /// height order starting right above the current head.
    ///
    /// Returns the number of blocks inserted. On failure the returned
    /// [`ChainInsertFailure`] names the length of the inserted prefix; blocks
    /// past the offender were not looked at.
    fn insert_chain(&self, blocks: &[Block]) -> Result<usize, ChainInsertFailure>;
}

/// Whether an insert failure is the fault of the streams that served the
/// blocks.
///
/// A missing quorum signature on the final block of a batch is the one
/// failure that is expected from honest peers: the block is simply the next
/// head and its signature has not been aggregated yet. Everything else means
/// some stream handed us a bad block.
pub fn blame_all_streams(batch_len: usize, err_index: usize, error: &ChainError) -> bool {
    !(matches!(error, ChainError::MissingSignature) && err_index + 1 == batch_len)
}
