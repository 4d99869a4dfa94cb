use crate::error::BlockTreeError;
use crate::store::BlockTreeStores;
use crate::tree::BlockTree;
use chain::{SpecProvider, SyncConfig};
use containers::{Block, BlockBody, BlockHeader, SuggestOptions, EMPTY_OMMERS_HASH, U256};
use std::sync::Arc;

pub const DEFAULT_DIFFICULTY: u64 = 1_000_000;
pub const DEFAULT_NONCE: u64 = 42;
const BLOCK_TIME: u64 = 12;

/// Deterministic chain factory.
///
/// Two builders with the same settings produce identical blocks, so chains of
/// different lengths share their common prefix. A different nonce produces a
/// fork of the same shape.
#[derive(Clone, Copy, Debug)]
pub struct ChainBuilder {
    difficulty: U256,
    nonce: u64,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self {
            difficulty: U256::from(DEFAULT_DIFFICULTY),
            nonce: DEFAULT_NONCE,
        }
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_difficulty(mut self, difficulty: U256) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Genesis does not depend on the nonce, so forks share it.
    pub fn genesis(&self) -> Block {
        let header = BlockHeader {
            ommers_hash: EMPTY_OMMERS_HASH,
            difficulty: self.difficulty,
            gas_limit: 30_000_000,
            ..BlockHeader::default()
        };
        Block::new(header.with_total_difficulty(Some(self.difficulty)), BlockBody::default())
    }

    pub fn child(&self, parent: &Block) -> Block {
        let header = BlockHeader {
            parent_hash: parent.hash(),
            ommers_hash: EMPTY_OMMERS_HASH,
            difficulty: self.difficulty,
            number: parent.number() + 1,
            gas_limit: parent.header.gas_limit,
            timestamp: parent.header.timestamp + BLOCK_TIME,
            nonce: self.nonce,
            ..BlockHeader::default()
        };
        let total_difficulty = parent.total_difficulty().map(|td| td + self.difficulty);
        Block::new(header.with_total_difficulty(total_difficulty), BlockBody::default())
    }

    /// `count` descendants of `parent`, in ascending order.
    pub fn extend(&self, parent: &Block, count: usize) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::with_capacity(count);
        for _ in 0..count {
            let block = self.child(blocks.last().unwrap_or(parent));
            blocks.push(block);
        }
        blocks
    }

    /// Genesis and its descendants, `length` blocks in total.
    pub fn build_chain(&self, length: usize) -> Vec<Block> {
        if length == 0 {
            return Vec::new();
        }
        let genesis = self.genesis();
        let mut chain = vec![genesis.clone()];
        chain.extend(self.extend(&genesis, length - 1));
        chain
    }

    /// Opens a tree over `stores` and suggests and processes a chain of
    /// `length` blocks into it.
    pub fn build_tree(
        &self,
        length: usize,
        stores: BlockTreeStores,
        spec: Arc<dyn SpecProvider>,
        config: &SyncConfig,
    ) -> Result<BlockTree, BlockTreeError> {
        let tree = BlockTree::open(stores, spec, config)?;
        for block in self.build_chain(length) {
            tree.suggest_block(&block, SuggestOptions::SHOULD_PROCESS)?;
            tree.update_main_chain(std::slice::from_ref(&block), true, false)?;
        }
        Ok(tree)
    }
}
