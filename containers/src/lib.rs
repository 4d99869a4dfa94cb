pub mod flags;
pub mod types;
pub mod checkpoint;
pub mod block;
pub mod block_info;
pub mod options;

pub use block::{Block, BlockBody, BlockHeader, EMPTY_OMMERS_HASH};
pub use block_info::{BlockInfo, BlockMetadata, ChainLevelInfo};
pub use checkpoint::Checkpoint;
pub use options::{
    AddBlockResult, InsertBlockOptions, InsertHeaderOptions, LookupOptions, SuggestOptions,
};
pub use types::{short_hash, BlockNumber, Bytes, Hash256, U256};
