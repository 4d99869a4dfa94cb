//! Shared scenario builder for block tree integration tests.
//!
//! A scenario holds a fully synced tree and a shorter tree that is being
//! synced towards it. Both are built by the same deterministic builder, so
//! they share their common prefix.
#![allow(dead_code)]

use block_tree::{BlockTree, BlockTreeStores, ChainBuilder, KeyValueStore};
use chain::{ChainSpec, SpecProvider, SyncConfig};
use containers::{
    AddBlockResult, Block, BlockHeader, BlockInfo, BlockMetadata, BlockNumber, Checkpoint,
    InsertBlockOptions, InsertHeaderOptions, LookupOptions, U256,
};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DIFFICULTY: u64 = block_tree::builder::DEFAULT_DIFFICULTY;

pub fn spec(terminal_total_difficulty: Option<u64>) -> Arc<dyn SpecProvider> {
    let mut spec = ChainSpec::default();
    spec.terminal_total_difficulty = terminal_total_difficulty.map(U256::from);
    Arc::new(spec)
}

pub fn build_tree(length: usize, spec: Arc<dyn SpecProvider>) -> (BlockTree, BlockTreeStores) {
    let stores = BlockTreeStores::in_memory();
    let tree = ChainBuilder::new()
        .build_tree(length, stores.clone(), spec, &SyncConfig::default())
        .expect("tree should build");
    (tree, stores)
}

pub fn block_at(tree: &BlockTree, number: BlockNumber) -> Block {
    tree.find_block_by_number(number, LookupOptions::empty())
        .expect("lookup should succeed")
        .unwrap_or_else(|| panic!("block {number} should exist"))
}

pub fn total_difficulty(number: BlockNumber) -> U256 {
    U256::from((number + 1) * DIFFICULTY)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TotalDifficultyMode {
    Null,
    Zero,
    SameAsSyncedTree,
}

impl TotalDifficultyMode {
    fn apply(self, header: &mut BlockHeader) {
        match self {
            Self::Null => header.total_difficulty = None,
            Self::Zero => header.total_difficulty = Some(U256::ZERO),
            Self::SameAsSyncedTree => {}
        }
    }
}

pub struct Scenario {
    pub synced_tree: BlockTree,
    pub not_synced_tree: BlockTree,
    pub not_synced_stores: BlockTreeStores,
    spec: Arc<dyn SpecProvider>,
    new_best_suggested: broadcast::Receiver<Block>,
}

impl Scenario {
    pub fn with_block_trees(not_synced_length: usize, synced_length: usize) -> Self {
        Self::with_block_trees_and_ttd(not_synced_length, synced_length, None)
    }

    pub fn with_block_trees_and_ttd(
        not_synced_length: usize,
        synced_length: usize,
        terminal_total_difficulty: Option<u64>,
    ) -> Self {
        let spec = spec(terminal_total_difficulty);
        let (not_synced_tree, not_synced_stores) = build_tree(not_synced_length, spec.clone());
        let (synced_tree, _) = build_tree(synced_length, spec.clone());
        let new_best_suggested = not_synced_tree.subscribe_new_best_suggested();

        Self {
            synced_tree,
            not_synced_tree,
            not_synced_stores,
            spec,
            new_best_suggested,
        }
    }

    pub fn synced_block(&self, number: BlockNumber) -> Block {
        block_at(&self.synced_tree, number)
    }

    /// Moves every block announced as best suggested to the main chain.
    fn process_new_best_suggested(&mut self) {
        while let Ok(block) = self.new_best_suggested.try_recv() {
            self.not_synced_tree
                .update_main_chain(&[block], true, false)
                .expect("main chain update should succeed");
        }
    }

    pub fn insert_beacon_pivot(self, number: BlockNumber) -> Self {
        let block = self.synced_block(number);
        let result = self
            .not_synced_tree
            .insert_block(
                &block,
                InsertBlockOptions::SAVE_HEADER,
                InsertHeaderOptions::BEACON_BLOCK_INSERT | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
            )
            .expect("pivot insert should succeed");
        assert_eq!(result, AddBlockResult::Added);

        self.not_synced_tree
            .set_beacon_pivot(Checkpoint::from(&block.header))
            .expect("pivot should persist");
        self
    }

    pub fn clear_beacon_pivot(self) -> Self {
        self.not_synced_tree
            .remove_beacon_pivot()
            .expect("pivot should be removed");
        self
    }

    pub fn suggest_blocks(mut self, low: BlockNumber, high: BlockNumber) -> Self {
        for number in low..=high {
            let block = self.synced_block(number);
            let result = self
                .not_synced_tree
                .suggest(&block)
                .expect("suggest should succeed");
            assert_eq!(result, AddBlockResult::Added, "suggesting block {number}");
            self.process_new_best_suggested();
        }
        self
    }

    pub fn insert_beacon_headers(
        self,
        low: BlockNumber,
        high: BlockNumber,
        mode: TotalDifficultyMode,
    ) -> Self {
        let mut options = InsertHeaderOptions::BEACON_HEADER_INSERT;
        if mode == TotalDifficultyMode::Null {
            options |= InsertHeaderOptions::TOTAL_DIFFICULTY_NOT_NEEDED;
        }
        for number in (low..=high).rev() {
            let mut header = self.synced_block(number).header;
            mode.apply(&mut header);
            let result = self
                .not_synced_tree
                .insert_header(&header, options)
                .expect("header insert should succeed");
            assert_eq!(result, AddBlockResult::Added, "inserting header {number}");
        }
        self
    }

    pub fn insert_beacon_blocks(
        self,
        low: BlockNumber,
        high: BlockNumber,
        mode: TotalDifficultyMode,
    ) -> Self {
        for number in (low..=high).rev() {
            let mut block = self.synced_block(number);
            mode.apply(&mut block.header);
            let result = self
                .not_synced_tree
                .insert_block(
                    &block,
                    InsertBlockOptions::SAVE_HEADER,
                    InsertHeaderOptions::BEACON_BLOCK_INSERT
                        | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
                )
                .expect("block insert should succeed");
            assert_eq!(result, AddBlockResult::Added, "inserting block {number}");
        }
        self
    }

    /// Inserts a fork over `[low, high]` into both trees. With
    /// `move_to_beacon_main_chain` the fork becomes main in the synced tree
    /// and beacon main in the other one.
    pub fn insert_fork(
        self,
        low: BlockNumber,
        high: BlockNumber,
        move_to_beacon_main_chain: bool,
    ) -> Self {
        let count = (high - low + 1) as usize;
        let parent = self.synced_block(low - 1);
        let fork = ChainBuilder::new().with_nonce(0).extend(&parent, count);

        let mut block_infos = Vec::with_capacity(count);
        for block in &fork {
            self.not_synced_tree
                .insert_block(
                    block,
                    InsertBlockOptions::SAVE_HEADER,
                    InsertHeaderOptions::BEACON_BLOCK_INSERT,
                )
                .expect("fork insert should succeed");
            self.synced_tree
                .insert_block(
                    block,
                    InsertBlockOptions::SAVE_HEADER,
                    InsertHeaderOptions::NOT_ON_MAIN_CHAIN,
                )
                .expect("fork insert should succeed");
            block_infos.push(
                BlockInfo::new(block.hash(), block.number(), Some(U256::ZERO))
                    .with_metadata(BlockMetadata::BEACON_BODY | BlockMetadata::BEACON_HEADER),
            );
        }

        if move_to_beacon_main_chain {
            self.synced_tree
                .update_main_chain(&fork, true, true)
                .expect("fork should become main");
            self.not_synced_tree
                .update_beacon_main_chain(&block_infos, high)
                .expect("fork should become beacon main");
        }
        self
    }

    pub fn restart(mut self) -> Self {
        self.not_synced_tree = BlockTree::open(
            self.not_synced_stores.clone(),
            self.spec.clone(),
            &SyncConfig::default(),
        )
        .expect("tree should reopen");
        self.new_best_suggested = self.not_synced_tree.subscribe_new_best_suggested();
        self
    }

    pub fn insert_to_header_db(&self, header: &BlockHeader) {
        let bytes = serde_json::to_vec(header).expect("header should encode");
        self.not_synced_stores
            .headers
            .set(header.hash().as_slice(), bytes)
            .expect("write should succeed");
    }

    pub fn insert_to_block_db(&self, block: &Block) {
        let bytes = serde_json::to_vec(block).expect("block should encode");
        self.not_synced_stores
            .blocks
            .set(block.hash().as_slice(), bytes)
            .expect("write should succeed");
    }

    pub fn assert_best_known_number(self, expected: BlockNumber) -> Self {
        assert_eq!(self.not_synced_tree.best_known_number(), expected);
        self
    }

    pub fn assert_best_suggested_header(self, expected: BlockNumber) -> Self {
        let header = self.not_synced_tree.best_suggested_header();
        assert_eq!(header.map(|header| header.number), Some(expected));
        self
    }

    pub fn assert_best_suggested_body(self, expected: BlockNumber) -> Self {
        let body = self.not_synced_tree.best_suggested_body();
        assert_eq!(body.map(|block| block.number()), Some(expected));
        self
    }

    pub fn assert_best_beacon_header(self, expected: Option<BlockNumber>) -> Self {
        let header = self.not_synced_tree.best_suggested_beacon_header();
        assert_eq!(header.map(|header| header.number), expected);
        self
    }

    pub fn assert_best_beacon_body(self, expected: Option<BlockNumber>) -> Self {
        let body = self.not_synced_tree.best_suggested_beacon_body();
        assert_eq!(body.map(|block| block.number()), expected);
        self
    }

    pub fn assert_best_known_beacon_number(self, expected: Option<BlockNumber>) -> Self {
        assert_eq!(self.not_synced_tree.best_known_beacon_number(), expected);
        self
    }

    pub fn assert_lowest_inserted_beacon_header(self, expected: BlockNumber) -> Self {
        let header = self.not_synced_tree.lowest_inserted_beacon_header();
        assert_eq!(header.map(|header| header.number), Some(expected));
        self
    }
}
