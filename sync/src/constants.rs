use std::time::Duration;

/// The timeout on one get-block-hashes request.
///
/// Hash windows are small, a healthy stream answers well within a second.
pub(crate) const BLOCK_HASHES_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// The timeout on one get-blocks-by-number request.
pub(crate) const BLOCKS_BY_NUMBER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The timeout on one get-blocks-by-hashes request.
pub(crate) const BLOCKS_BY_HASHES_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a worker sleeps when there is no batch to request, unless the
/// result signal wakes it earlier.
pub(crate) const WORKER_IDLE_BACKOFF: Duration = Duration::from_millis(200);

/// How long the inserter sleeps when no contiguous run is available, unless
/// the result signal wakes it earlier.
pub(crate) const INSERTER_IDLE_BACKOFF: Duration = Duration::from_millis(200);

/// The interval at which the cycle driver checks the chain head and the
/// stream count.
pub(crate) const CYCLE_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long the stream count may stay below `min_streams` before the cycle
/// is aborted.
pub(crate) const STREAM_SHORTAGE_GRACE: Duration = Duration::from_secs(10);
