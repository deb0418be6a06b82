//! Sync configuration.
use crate::error::SyncError;

/// Configuration for one sync cycle, shared by the long-range downloader and
/// the short-range reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// The number of parallel request workers, in both the downloader and the
    /// short-range helper. Must be at least 1.
    pub concurrency: usize,
    /// The maximum amount of heights in one get-blocks-by-number request.
    pub blocks_per_request: usize,
    /// The size of the hash-gather window used by the short-range helper.
    pub block_hashes_per_request: usize,
    /// The batch size for get-blocks-by-hashes requests.
    pub blocks_per_hashes_request: usize,
    /// The result-queue length at which the downloader stops requesting
    /// heights it has never asked for before. Retries are always served.
    pub soft_queue_cap: usize,
    /// The maximum amount of blocks handed to the chain in one insert call.
    pub insert_batch_size: usize,
    /// The cycle is aborted when fewer streams than this stay connected for a
    /// sustained period.
    pub min_streams: usize,
    /// Caps how far past the local head a single cycle may reach.
    /// `0` means unlimited.
    pub max_blocks_per_cycle: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            blocks_per_request: 10,
            block_hashes_per_request: 20,
            blocks_per_hashes_request: 10,
            soft_queue_cap: 100,
            insert_batch_size: 128,
            min_streams: 3,
            max_blocks_per_cycle: 0,
        }
    }
}

impl SyncConfig {
    /// Checks the configuration for values the sync loops cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.concurrency == 0 {
            return Err(SyncError::InvalidConfig("concurrency must be at least 1"));
        }
        if self.blocks_per_request == 0 {
            return Err(SyncError::InvalidConfig(
                "blocks_per_request must be at least 1",
            ));
        }
        if self.blocks_per_hashes_request == 0 {
            return Err(SyncError::InvalidConfig(
                "blocks_per_hashes_request must be at least 1",
            ));
        }
        if self.block_hashes_per_request == 0 {
            return Err(SyncError::InvalidConfig(
                "block_hashes_per_request must be at least 1",
            ));
        }
        if self.insert_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "insert_batch_size must be at least 1",
            ));
        }
        Ok(())
    }

    /// Adjusts the configuration for the shard the chain lives on.
    ///
    /// The beacon shard keeps the full worker count, ordinary shards run
    /// with half of it since they share the host with the beacon syncer.
    pub fn for_shard(mut self, shard_id: u32, beacon_shard_id: u32) -> Self {
        if shard_id != beacon_shard_id {
            self.concurrency = (self.concurrency / 2).max(1);
            self.min_streams = (self.min_streams / 2).max(1);
        }
        self
    }
}
