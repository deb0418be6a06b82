//! # Lattice Sync
//!
//! The block-synchronization core of a lattice node: brings the local chain
//! up to the network tip by fetching blocks concurrently from many peer
//! streams, ordering and validating them, and inserting them in strict
//! height order.
//!
//! Two cooperating protocols live here:
//!
//! - The long-range [`downloader`], driven by [`downloader::download_blocks`]:
//!   a [`downloader::DownloadManager`] tracks every height between the local
//!   head and the cycle target while a pool of workers pulls batches and one
//!   inserter feeds the chain.
//! - The [`short_range`] reconciler, driven by
//!   [`short_range::run_short_range_sync`]: for small divergences, agree on
//!   the next few hashes with a strict majority of streams, then fetch
//!   exactly those bodies from the attesting streams.
//!
//! The peer streams and the local chain are reached through the
//! [`StreamPool`] and [`Chain`] seams; this crate never owns either.
pub mod chain;
pub mod config;
mod constants;
pub mod downloader;
mod error;
pub mod short_range;
pub mod streams;

#[cfg(test)]
pub(crate) mod test_utils;

pub use chain::{blame_all_streams, Chain, ChainError, ChainInsertFailure};
pub use config::SyncConfig;
pub use downloader::{download_blocks, BlockResult, DownloadDetails, DownloadManager};
pub use error::SyncError;
pub use short_range::{run_short_range_sync, ShortRangeHelper};
pub use streams::{RequestErrorKind, StreamPool, StreamRequestError};
