//! The seam between the sync core and the peer-stream pool.
use async_trait::async_trait;

use lattice_types::{Block, BlockHash, BlockNumber, StreamId};

/// Why a stream request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestErrorKind {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The stream went away while the request was in flight.
    #[error("stream closed")]
    StreamClosed,
    /// No connected stream was able to take the request.
    #[error("no stream available for the request")]
    NoAvailableStream,
    /// The response failed validation.
    #[error("response failed validation: {0}")]
    InvalidResponse(&'static str),
}

/// A failed stream request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stream request failed: {kind}")]
pub struct StreamRequestError {
    /// The stream the request was assigned to, if one had been picked before
    /// the failure.
    pub stream_id: Option<StreamId>,
    /// What went wrong.
    #[source]
    pub kind: RequestErrorKind,
}

impl StreamRequestError {
    /// A failure on a known stream.
    pub fn on_stream(stream_id: StreamId, kind: RequestErrorKind) -> Self {
        Self {
            stream_id: Some(stream_id),
            kind,
        }
    }

    /// A failure with no stream attached, e.g. a timeout before any stream
    /// answered.
    pub fn no_stream(kind: RequestErrorKind) -> Self {
        Self {
            stream_id: None,
            kind,
        }
    }
}

/// A pool of bidirectional peer streams delivering typed request/response
/// messages.
///
/// The pool owns the streams and their lifecycles; the sync core only ever
/// *requests* removal. All methods are callable from any task.
#[async_trait]
pub trait StreamPool: Send + Sync + 'static {
    /// The number of healthy streams currently in the pool.
    fn num_streams(&self) -> usize;

    /// Requests the hashes of the given heights from one stream.
    ///
    /// On success the returned vector has exactly `bns.len()` entries, in
    /// request order; heights past the serving peer's tip come back as
    /// [`lattice_types::EMPTY_HASH`].
    async fn get_block_hashes(
        &self,
        bns: &[BlockNumber],
    ) -> Result<(Vec<BlockHash>, StreamId), StreamRequestError>;

    /// Requests full blocks for the given heights from one stream.
    ///
    /// Heights the serving peer does not have come back as `None`; the
    /// vector is positionally aligned with `bns`.
    async fn get_blocks_by_number(
        &self,
        bns: &[BlockNumber],
    ) -> Result<(Vec<Option<Block>>, StreamId), StreamRequestError>;

    /// Requests full blocks by hash from one stream in `whitelist`.
    ///
    /// The vector is positionally aligned with `hashes`.
    async fn get_blocks_by_hashes(
        &self,
        hashes: &[BlockHash],
        whitelist: &[StreamId],
    ) -> Result<(Vec<Option<Block>>, StreamId), StreamRequestError>;

    /// Removes a stream from the pool. Idempotent.
    fn remove_stream(&self, stream_id: &StreamId);
}
