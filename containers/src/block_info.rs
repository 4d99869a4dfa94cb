use crate::{flags, BlockNumber, Hash256, U256};
use serde::{Deserialize, Serialize};

flags! {
    /// Provenance and beacon main chain membership of a stored block.
    #[derive(Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BlockMetadata: u8 {
        const BEACON_HEADER = 1;
        const BEACON_BODY = 2;
        const BEACON_MAIN_CHAIN = 4;
    }
}

/// Per-block annotation kept in a chain level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub block_hash: Hash256,
    pub block_number: BlockNumber,
    /// `None` while unknown. `Some(0)` is a placeholder and kept as is.
    pub total_difficulty: Option<U256>,
    #[serde(default)]
    pub metadata: BlockMetadata,
    #[serde(default)]
    pub was_processed: bool,
}

impl BlockInfo {
    pub fn new(
        block_hash: Hash256,
        block_number: BlockNumber,
        total_difficulty: Option<U256>,
    ) -> Self {
        Self {
            block_hash,
            block_number,
            total_difficulty,
            metadata: BlockMetadata::empty(),
            was_processed: false,
        }
    }

    pub fn with_metadata(mut self, metadata: BlockMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Inserted by beacon sync and not yet suggested classically.
    pub fn is_beacon_info(&self) -> bool {
        self.metadata
            .intersects(BlockMetadata::BEACON_HEADER | BlockMetadata::BEACON_BODY)
    }

    pub fn is_beacon_header(&self) -> bool {
        self.metadata.contains(BlockMetadata::BEACON_HEADER)
    }

    pub fn is_beacon_body(&self) -> bool {
        self.metadata.contains(BlockMetadata::BEACON_BODY)
    }

    pub fn is_beacon_main_chain(&self) -> bool {
        self.metadata.contains(BlockMetadata::BEACON_MAIN_CHAIN)
    }
}

/// All candidate blocks known at one height.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLevelInfo {
    pub block_infos: Vec<BlockInfo>,
    pub main_chain_index: Option<usize>,
}

impl ChainLevelInfo {
    pub fn new(block_info: BlockInfo) -> Self {
        Self {
            block_infos: vec![block_info],
            main_chain_index: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block_infos.is_empty()
    }

    pub fn len(&self) -> usize {
        self.block_infos.len()
    }

    pub fn has_block_on_main_chain(&self) -> bool {
        self.main_chain_index.is_some()
    }

    pub fn find_index(&self, hash: &Hash256) -> Option<usize> {
        self.block_infos
            .iter()
            .position(|info| info.block_hash == *hash)
    }

    pub fn find_block_info(&self, hash: &Hash256) -> Option<&BlockInfo> {
        self.block_infos.iter().find(|info| info.block_hash == *hash)
    }

    pub fn find_block_info_mut(&mut self, hash: &Hash256) -> Option<&mut BlockInfo> {
        self.block_infos
            .iter_mut()
            .find(|info| info.block_hash == *hash)
    }

    pub fn main_chain_block(&self) -> Option<&BlockInfo> {
        self.main_chain_index
            .and_then(|index| self.block_infos.get(index))
    }

    pub fn beacon_main_chain_index(&self) -> Option<usize> {
        self.block_infos
            .iter()
            .position(BlockInfo::is_beacon_main_chain)
            .or(self.main_chain_index)
            .or_else(|| self.block_infos.iter().position(BlockInfo::is_beacon_info))
    }

    /// Flagged beacon main entry, else the main entry, else the first beacon info.
    pub fn beacon_main_chain_block(&self) -> Option<&BlockInfo> {
        self.beacon_main_chain_index()
            .and_then(|index| self.block_infos.get(index))
    }

    /// Main entry, else the candidate with the highest known total difficulty.
    pub fn main_or_heaviest(&self) -> Option<&BlockInfo> {
        self.main_chain_block().or_else(|| {
            self.block_infos
                .iter()
                .filter(|info| info.total_difficulty.is_some())
                .max_by_key(|info| info.total_difficulty)
                .or_else(|| self.block_infos.first())
        })
    }

    /// Moves `index` into the main chain slot, placing it first in the list.
    pub fn set_main_chain_index(&mut self, index: usize) {
        if index != 0 && index < self.block_infos.len() {
            self.block_infos.swap(0, index);
        }
        self.main_chain_index = Some(0);
    }

    pub fn clear_main_chain(&mut self) {
        self.main_chain_index = None;
    }

    /// Flags `index` as the beacon main entry and clears the flag on the others.
    pub fn set_beacon_main_chain(&mut self, index: usize) {
        for (position, info) in self.block_infos.iter_mut().enumerate() {
            if position == index {
                info.metadata.insert(BlockMetadata::BEACON_MAIN_CHAIN);
            } else {
                info.metadata.remove(BlockMetadata::BEACON_MAIN_CHAIN);
            }
        }
    }

    pub fn clear_beacon_main_chain(&mut self) {
        for info in &mut self.block_infos {
            info.metadata.remove(BlockMetadata::BEACON_MAIN_CHAIN);
        }
    }

    pub fn has_beacon_block(&self) -> bool {
        self.block_infos
            .iter()
            .any(|info| info.is_beacon_info() || info.is_beacon_main_chain())
    }

    /// Index of `hash`, appending `block_info` when the hash is new.
    pub fn insert_or_get(&mut self, block_info: BlockInfo) -> (usize, bool) {
        match self.find_index(&block_info.block_hash) {
            Some(index) => (index, false),
            None => {
                self.block_infos.push(block_info);
                (self.block_infos.len() - 1, true)
            }
        }
    }
}
