pub mod builder;
pub mod chain_levels;
pub mod codec;
pub mod error;
pub mod helpers;
pub mod store;
pub mod tree;

pub use builder::ChainBuilder;
pub use chain_levels::ChainLevelRepository;
pub use error::{BlockTreeError, StoreError};
pub use store::{BlockTreeStores, KeyValueStore, MemDb, MetadataKey};
pub use tree::{BlockTree, ChainPointers};
