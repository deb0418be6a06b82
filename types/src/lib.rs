//! # Lattice Types
//!
//! Shared core types for the lattice node. This crate is kept free of
//! networking and storage concerns so it can be depended on from every
//! layer of the node.
use std::{fmt, sync::Arc};

use sha3::{Digest, Keccak256};

/// The height of a block in the canonical chain, starting at `0` for genesis.
pub type BlockNumber = u64;

/// A block hash.
pub type BlockHash = [u8; 32];

/// The all-zero hash, used on the wire for "block unknown".
pub const EMPTY_HASH: BlockHash = [0; 32];

/// An aggregated quorum signature over a block.
pub type Signature = [u8; 96];

/// An opaque identifier of one peer stream.
///
/// Stream ids are short strings handed to us by the stream pool. They are
/// cloned liberally across worker tasks, so the backing storage is shared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(Arc<str>);

impl StreamId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A block header.
///
/// Only the fields the synchronization layer needs are modelled here, the
/// rest of the header travels inside [`Block::payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// The height of this block.
    pub number: BlockNumber,
    /// The hash of the parent block.
    pub parent_hash: BlockHash,
    /// The shard this block belongs to.
    pub shard_id: u32,
    /// The block timestamp, in seconds since the epoch.
    pub timestamp: u64,
}

impl BlockHeader {
    /// The Keccak-256 digest of the encoded header, which is the block's id.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Keccak256::new();
        hasher.update(self.number.to_le_bytes());
        hasher.update(self.parent_hash);
        hasher.update(self.shard_id.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.finalize().into()
    }
}

/// A block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The block header.
    pub header: BlockHeader,
    /// The aggregated quorum signature over this block.
    ///
    /// Blocks very close to the network tip may not carry one yet, they are
    /// folded into the chain once the quorum has signed.
    pub signature: Option<Signature>,
    /// The encoded block body.
    pub payload: Vec<u8>,
}

impl Block {
    /// Returns the height of this block.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Returns the hash of this block.
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Returns the hash of this block's parent.
    pub fn parent_hash(&self) -> BlockHash {
        self.header.parent_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_hash_commits_to_all_fields() {
        let header = BlockHeader {
            number: 7,
            parent_hash: [1; 32],
            shard_id: 0,
            timestamp: 1_700_000_000,
        };

        let mut other = header.clone();
        assert_eq!(header.hash(), other.hash());

        other.number = 8;
        assert_ne!(header.hash(), other.hash());

        other = header.clone();
        other.parent_hash = [2; 32];
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn stream_id_display_round_trips() {
        let id = StreamId::from("peer-1");
        assert_eq!(id.to_string(), "peer-1");
        assert_eq!(id, StreamId::from(String::from("peer-1")));
    }
}
