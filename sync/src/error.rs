use lattice_types::BlockNumber;

use crate::chain::ChainError;

/// An error that ends a sync cycle.
///
/// Recoverable faults (a stream timing out, a peer sending a short response,
/// a single bad block) are handled inside the cycle and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// There were not enough streams to start the cycle.
    #[error("not enough streams to run a sync cycle, have {have}, need {need}")]
    NotEnoughStreams {
        /// The number of streams currently connected.
        have: usize,
        /// The number of streams the cycle requires.
        need: usize,
    },
    /// The configuration failed validation.
    #[error("invalid sync configuration: {0}")]
    InvalidConfig(&'static str),
    /// The cycle context was cancelled.
    #[error("sync cycle cancelled")]
    Cancelled,
    /// The stream pool stayed below the minimum stream count for too long.
    #[error("fewer than {min} streams available for a sustained period, aborting cycle")]
    StreamShortage {
        /// The configured minimum stream count.
        min: usize,
    },
    /// Every stream that attested to a hash chain failed to serve one of its
    /// batches of block bodies.
    #[error("every whitelisted stream failed while fetching block bodies")]
    WhitelistExhausted,
    /// The chain rejected a block that a quorum of streams attested to.
    #[error("chain rejected block {number}")]
    ChainRejected {
        /// The height of the rejected block.
        number: BlockNumber,
        /// The chain's verification error.
        #[source]
        source: ChainError,
    },
}
