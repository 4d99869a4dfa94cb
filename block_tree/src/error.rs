use containers::{BlockNumber, Hash256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("metadata entry {key} has {len} bytes")]
    MalformedMetadata { key: &'static str, len: usize },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum BlockTreeError {
    /// Bytes for the block exist but its ancestry cannot be linked to a known level.
    #[error("dangling block {hash} at {number}: parent chain cannot be linked to a known level")]
    DanglingBlock { number: BlockNumber, hash: Hash256 },
    #[error("unknown block {hash} at {number}")]
    UnknownBlock { number: BlockNumber, hash: Hash256 },
    #[error("head block {hash} has no total difficulty")]
    HeadWithoutTotalDifficulty { hash: Hash256 },
    #[error(transparent)]
    Store(#[from] StoreError),
}
