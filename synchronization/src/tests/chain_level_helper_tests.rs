use crate::beacon_pivot::BeaconPivot;
use crate::chain_level_helper::{BlockDownloadContext, ChainLevelHelper};
use crate::tests::{block_at, build_tree, main_chain_hash};
use block_tree::builder::DEFAULT_DIFFICULTY;
use block_tree::{BlockTree, ChainBuilder};
use containers::{
    AddBlockResult, BlockInfo, BlockMetadata, BlockNumber, InsertBlockOptions,
    InsertHeaderOptions, LookupOptions, SuggestOptions, U256,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Trees {
    synced: Arc<BlockTree>,
    not_synced: Arc<BlockTree>,
}

impl Trees {
    fn new(not_synced_length: usize, synced_length: usize) -> Self {
        Self {
            synced: build_tree(synced_length),
            not_synced: build_tree(not_synced_length),
        }
    }

    fn helper(&self) -> ChainLevelHelper {
        let pivot = Arc::new(BeaconPivot::new(self.not_synced.clone()).unwrap());
        ChainLevelHelper::new(self.not_synced.clone(), pivot)
    }

    fn insert_beacon_blocks(&self, low: BlockNumber, high: BlockNumber) {
        for number in (low..=high).rev() {
            let block = block_at(&self.synced, number);
            self.not_synced
                .insert_block(
                    &block,
                    InsertBlockOptions::SAVE_HEADER,
                    InsertHeaderOptions::BEACON_BLOCK_INSERT
                        | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
                )
                .unwrap();
        }
    }

    fn insert_beacon_headers(&self, low: BlockNumber, high: BlockNumber) {
        for number in (low..=high).rev() {
            let header = block_at(&self.synced, number).header.with_total_difficulty(None);
            self.not_synced
                .insert_header(
                    &header,
                    InsertHeaderOptions::BEACON_HEADER_INSERT
                        | InsertHeaderOptions::TOTAL_DIFFICULTY_NOT_NEEDED,
                )
                .unwrap();
        }
    }

    /// Fork over `[low, high]`, main in the synced tree and beacon main in
    /// the other one.
    fn insert_fork(&self, low: BlockNumber, high: BlockNumber) {
        let parent = block_at(&self.synced, low - 1);
        let fork = ChainBuilder::new()
            .with_nonce(0)
            .extend(&parent, (high - low + 1) as usize);

        let mut block_infos = Vec::new();
        for block in &fork {
            self.not_synced
                .insert_block(
                    block,
                    InsertBlockOptions::SAVE_HEADER,
                    InsertHeaderOptions::BEACON_BLOCK_INSERT,
                )
                .unwrap();
            self.synced
                .insert_block(
                    block,
                    InsertBlockOptions::SAVE_HEADER,
                    InsertHeaderOptions::NOT_ON_MAIN_CHAIN,
                )
                .unwrap();
            block_infos.push(
                BlockInfo::new(block.hash(), block.number(), Some(U256::ZERO))
                    .with_metadata(BlockMetadata::BEACON_HEADER | BlockMetadata::BEACON_BODY),
            );
        }
        self.synced.update_main_chain(&fork, true, true).unwrap();
        self.not_synced.update_beacon_main_chain(&block_infos, high).unwrap();
    }
}

#[test]
fn test_no_headers_without_beacon_chain() {
    let trees = Trees::new(4, 10);
    assert_eq!(trees.helper().get_next_headers(10, 100).unwrap(), None);
}

#[test]
fn test_next_headers_start_at_anchor() {
    let trees = Trees::new(4, 10);
    trees.insert_beacon_blocks(4, 9);

    let headers = trees.helper().get_next_headers(4, 100).unwrap().unwrap();
    let numbers: Vec<_> = headers.iter().map(|header| header.number).collect();
    assert_eq!(numbers, vec![3, 4, 5, 6]);
    assert_eq!(headers[0].hash(), block_at(&trees.synced, 3).hash());
    assert_eq!(headers[1].total_difficulty, Some(U256::from(5 * DEFAULT_DIFFICULTY)));
}

#[test]
fn test_next_headers_stop_at_max_number() {
    let trees = Trees::new(4, 10);
    trees.insert_beacon_blocks(4, 9);

    let headers = trees.helper().get_next_headers(100, 5).unwrap().unwrap();
    let numbers: Vec<_> = headers.iter().map(|header| header.number).collect();
    assert_eq!(numbers, vec![3, 4, 5]);
}

#[test]
fn test_next_headers_leave_unknown_total_difficulty_empty() {
    let trees = Trees::new(4, 10);
    trees.insert_beacon_headers(4, 6);

    let headers = trees.helper().get_next_headers(3, 100).unwrap().unwrap();
    assert_eq!(headers[0].total_difficulty, Some(U256::from(4 * DEFAULT_DIFFICULTY)));
    assert_eq!(headers[1].total_difficulty, None);
}

#[test]
fn test_try_set_next_blocks_from_local_bodies() {
    let trees = Trees::new(4, 10);
    trees.insert_beacon_blocks(4, 9);
    let helper = trees.helper();

    let headers = helper.get_next_headers(4, 100).unwrap().unwrap();
    let mut context = BlockDownloadContext::new(headers[1..].to_vec());
    assert!(helper.try_set_next_blocks(2, &mut context).unwrap());
    assert!(context.is_complete());

    let blocks = context.blocks();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[2].body, block_at(&trees.synced, 6).body);
}

#[test]
fn test_try_set_next_blocks_needs_peers_for_headers_only() {
    let trees = Trees::new(4, 10);
    trees.insert_beacon_headers(4, 6);
    let helper = trees.helper();

    let headers = helper.get_next_headers(3, 100).unwrap().unwrap();
    let mut context = BlockDownloadContext::new(headers[1..].to_vec());
    assert!(!helper.try_set_next_blocks(2, &mut context).unwrap());
    assert_eq!(context.missing().len(), 2);
    assert!(context.blocks().is_empty());
}

#[test]
fn test_can_reorg_beacon_main_chain() {
    let trees = Trees::new(4, 10);
    trees.insert_beacon_blocks(4, 9);
    trees.insert_fork(6, 9);
    let helper = trees.helper();
    let options = SuggestOptions::SHOULD_PROCESS
        | SuggestOptions::FILL_BEACON_BLOCK
        | SuggestOptions::FORCE_SET_AS_MAIN;

    while let Some(headers) = helper.get_next_headers(2, 100).unwrap() {
        if headers.len() <= 1 {
            break;
        }
        for header in &headers[1..] {
            let mut block = trees
                .not_synced
                .find_block(&header.hash(), LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED)
                .unwrap()
                .unwrap();
            block.header.total_difficulty = header.total_difficulty;
            assert_eq!(
                trees.not_synced.suggest_block(&block, options).unwrap(),
                AddBlockResult::Added
            );
            trees.not_synced.update_main_chain(&[block], true, false).unwrap();
        }
    }

    for number in 0..=9 {
        assert_eq!(
            main_chain_hash(&trees.not_synced, number),
            main_chain_hash(&trees.synced, number),
            "level {number}"
        );
        let header = trees
            .not_synced
            .find_header_by_number(number, LookupOptions::REQUIRE_CANONICAL)
            .unwrap()
            .unwrap();
        assert_ne!(header.total_difficulty, Some(U256::ZERO), "level {number}");
    }
    assert_eq!(trees.not_synced.head().map(|head| head.number()), Some(9));
}
