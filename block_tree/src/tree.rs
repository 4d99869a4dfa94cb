use crate::chain_levels::ChainLevelRepository;
use crate::codec::{decode, decode_hash, decode_number, encode};
use crate::error::{BlockTreeError, StoreError};
use crate::helpers::{improvement_requirements_satisfied, search_highest, ImprovementBaseline};
use crate::store::{BlockTreeStores, MetadataKey};
use chain::{SpecProvider, SyncConfig};
use containers::{
    short_hash, AddBlockResult, Block, BlockHeader, BlockInfo, BlockMetadata, BlockNumber,
    ChainLevelInfo, Checkpoint, Hash256, InsertBlockOptions, InsertHeaderOptions, LookupOptions,
    SuggestOptions, U256,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Best-pointer set of a block tree.
#[derive(Clone, Debug, Default)]
pub struct ChainPointers {
    pub genesis: Option<BlockHeader>,
    pub head: Option<Block>,
    pub best_known_number: BlockNumber,
    pub best_suggested_header: Option<BlockHeader>,
    pub best_suggested_body: Option<Block>,
    pub lowest_inserted_header: Option<BlockHeader>,
    pub best_known_beacon_number: Option<BlockNumber>,
    pub best_suggested_beacon_header: Option<BlockHeader>,
    pub best_suggested_beacon_body: Option<Block>,
    pub lowest_inserted_beacon_header: Option<BlockHeader>,
}

/// Canonical chain store.
///
/// Owns the header, block, chain level and metadata stores. Every mutation
/// runs under the write half of `pointers`, so the read and write halves of
/// a level update never interleave with another mutation. Lookups take the
/// read half and only escalate when they have to link a missing level.
pub struct BlockTree {
    stores: BlockTreeStores,
    levels: ChainLevelRepository,
    spec: Arc<dyn SpecProvider>,
    pointers: RwLock<ChainPointers>,
    new_best_suggested: broadcast::Sender<Block>,
    new_head: broadcast::Sender<Block>,
}

impl BlockTree {
    /// Opens a tree over `stores`, restoring the best pointers persisted there.
    pub fn open(
        stores: BlockTreeStores,
        spec: Arc<dyn SpecProvider>,
        config: &SyncConfig,
    ) -> Result<Self, BlockTreeError> {
        let (new_best_suggested, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (new_head, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let tree = Self {
            levels: ChainLevelRepository::new(stores.chain_levels.clone()),
            stores,
            spec,
            pointers: RwLock::new(ChainPointers::default()),
            new_best_suggested,
            new_head,
        };

        let pointers = tree.load_pointers(config.best_known_search_limit)?;
        info!(
            head = pointers.head.as_ref().map(Block::number),
            best_known = pointers.best_known_number,
            best_suggested_body = pointers.best_suggested_body.as_ref().map(Block::number),
            best_known_beacon = pointers.best_known_beacon_number,
            lowest_beacon_header = pointers.lowest_inserted_beacon_header.as_ref().map(|h| h.number),
            "Block tree opened"
        );
        *tree.pointers.write() = pointers;

        Ok(tree)
    }

    pub fn stores(&self) -> &BlockTreeStores {
        &self.stores
    }

    pub fn spec(&self) -> &Arc<dyn SpecProvider> {
        &self.spec
    }

    pub fn pointers(&self) -> ChainPointers {
        self.pointers.read().clone()
    }

    pub fn genesis(&self) -> Option<BlockHeader> {
        self.pointers.read().genesis.clone()
    }

    pub fn head(&self) -> Option<Block> {
        self.pointers.read().head.clone()
    }

    pub fn best_known_number(&self) -> BlockNumber {
        self.pointers.read().best_known_number
    }

    pub fn best_suggested_header(&self) -> Option<BlockHeader> {
        self.pointers.read().best_suggested_header.clone()
    }

    pub fn best_suggested_body(&self) -> Option<Block> {
        self.pointers.read().best_suggested_body.clone()
    }

    pub fn lowest_inserted_header(&self) -> Option<BlockHeader> {
        self.pointers.read().lowest_inserted_header.clone()
    }

    pub fn best_known_beacon_number(&self) -> Option<BlockNumber> {
        self.pointers.read().best_known_beacon_number
    }

    pub fn best_suggested_beacon_header(&self) -> Option<BlockHeader> {
        self.pointers.read().best_suggested_beacon_header.clone()
    }

    pub fn best_suggested_beacon_body(&self) -> Option<Block> {
        self.pointers.read().best_suggested_beacon_body.clone()
    }

    pub fn lowest_inserted_beacon_header(&self) -> Option<BlockHeader> {
        self.pointers.read().lowest_inserted_beacon_header.clone()
    }

    /// Blocks that became best suggested while flagged for processing.
    /// Dropping the receiver unsubscribes.
    pub fn subscribe_new_best_suggested(&self) -> broadcast::Receiver<Block> {
        self.new_best_suggested.subscribe()
    }

    pub fn subscribe_new_head(&self) -> broadcast::Receiver<Block> {
        self.new_head.subscribe()
    }

    pub fn insert_header(
        &self,
        header: &BlockHeader,
        options: InsertHeaderOptions,
    ) -> Result<AddBlockResult, BlockTreeError> {
        self.insert_internal(header, None, InsertBlockOptions::SAVE_HEADER, options)
    }

    pub fn insert_block(
        &self,
        block: &Block,
        block_options: InsertBlockOptions,
        header_options: InsertHeaderOptions,
    ) -> Result<AddBlockResult, BlockTreeError> {
        self.insert_internal(&block.header, Some(block), block_options, header_options)
    }

    fn insert_internal(
        &self,
        header: &BlockHeader,
        block: Option<&Block>,
        block_options: InsertBlockOptions,
        options: InsertHeaderOptions,
    ) -> Result<AddBlockResult, BlockTreeError> {
        let hash = header.hash();
        let number = header.number;
        let saves_header = block.is_none() || block_options.contains(InsertBlockOptions::SAVE_HEADER);

        let mut pointers = self.pointers.write();
        if header.is_genesis() {
            if let Some(genesis) = &pointers.genesis {
                if genesis.hash() != hash {
                    warn!(hash = %hash, "Rejected insert of a second genesis block");
                    return Ok(AddBlockResult::InvalidBlock);
                }
            }
        }

        let total_difficulty = self.total_difficulty_for_insert(header, options)?;
        if let Some(block) = block {
            self.stores.blocks.set(hash.as_slice(), encode(block)?)?;
        }
        if saves_header {
            self.stores.headers.set(hash.as_slice(), encode(header)?)?;
        }

        let mut metadata = BlockMetadata::empty();
        if options.contains(InsertHeaderOptions::BEACON_HEADER_METADATA) {
            metadata.insert(BlockMetadata::BEACON_HEADER);
        }
        if block.is_some() && options.contains(InsertHeaderOptions::BEACON_BODY_METADATA) {
            metadata.insert(BlockMetadata::BEACON_BODY);
        }
        if options.contains(InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN) {
            metadata.insert(BlockMetadata::BEACON_MAIN_CHAIN);
        }

        let block_info = BlockInfo::new(hash, number, total_difficulty).with_metadata(metadata);
        let changed = self.update_or_create_level(
            block_info,
            !options.contains(InsertHeaderOptions::NOT_ON_MAIN_CHAIN),
            options.contains(InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN),
        )?;

        let annotated = header.clone().with_total_difficulty(total_difficulty);
        if options.contains(InsertHeaderOptions::BEACON_HEADER_METADATA) {
            if pointers
                .lowest_inserted_beacon_header
                .as_ref()
                .is_none_or(|lowest| number < lowest.number)
            {
                self.stores.metadata.set(
                    MetadataKey::LowestInsertedBeaconHeaderHash.as_bytes(),
                    hash.to_vec(),
                )?;
                pointers.lowest_inserted_beacon_header = Some(annotated.clone());
            }
            if pointers
                .best_known_beacon_number
                .is_none_or(|best| number > best)
            {
                pointers.best_known_beacon_number = Some(number);
            }
            if pointers
                .best_suggested_beacon_header
                .as_ref()
                .is_none_or(|best| number > best.number)
            {
                pointers.best_suggested_beacon_header = Some(annotated.clone());
            }
            if let Some(block) = block.filter(|_| metadata.contains(BlockMetadata::BEACON_BODY)) {
                if pointers
                    .best_suggested_beacon_body
                    .as_ref()
                    .is_none_or(|best| number > best.number())
                {
                    pointers.best_suggested_beacon_body = Some(Block::new(
                        annotated.clone(),
                        block.body.clone(),
                    ));
                }
            }
        } else if saves_header {
            if pointers
                .lowest_inserted_header
                .as_ref()
                .is_none_or(|lowest| number < lowest.number)
            {
                self.stores.metadata.set(
                    MetadataKey::LowestInsertedHeaderHash.as_bytes(),
                    hash.to_vec(),
                )?;
                pointers.lowest_inserted_header = Some(annotated.clone());
            }
            pointers.best_known_number = pointers.best_known_number.max(number);
        }

        trace!(
            number,
            hash = %short_hash(&hash),
            total_difficulty = ?total_difficulty,
            options = ?options,
            changed,
            "Inserted block record"
        );

        Ok(if changed {
            AddBlockResult::Added
        } else {
            AddBlockResult::AlreadyKnown
        })
    }

    fn total_difficulty_for_insert(
        &self,
        header: &BlockHeader,
        options: InsertHeaderOptions,
    ) -> Result<Option<U256>, BlockTreeError> {
        if header.total_difficulty.is_some() {
            return Ok(header.total_difficulty);
        }
        if options.contains(InsertHeaderOptions::TOTAL_DIFFICULTY_NOT_NEEDED) {
            return Ok(None);
        }
        if header.is_genesis() {
            return Ok(Some(header.difficulty));
        }

        let parent_total_difficulty = self
            .levels
            .load_level(header.number - 1)?
            .and_then(|level| {
                level
                    .find_block_info(&header.parent_hash)
                    .and_then(|info| info.total_difficulty)
            });
        Ok(parent_total_difficulty.map(|parent| parent + header.difficulty))
    }

    /// Records `incoming` at its level. Returns whether the level changed.
    fn update_or_create_level(
        &self,
        incoming: BlockInfo,
        set_as_main: bool,
        set_as_beacon_main: bool,
    ) -> Result<bool, BlockTreeError> {
        let number = incoming.block_number;
        let mut level = self.levels.load_level(number)?.unwrap_or_default();
        let before = level.clone();

        let (index, inserted) = level.insert_or_get(incoming.clone());
        if !inserted {
            merge_block_info(&mut level.block_infos[index], &incoming);
        }

        if set_as_beacon_main {
            level.set_beacon_main_chain(index);
        }
        if set_as_main {
            level.set_main_chain_index(index);
        }

        let changed = level != before;
        if changed {
            self.levels.persist_level(number, &level)?;
        }
        Ok(changed)
    }

    pub fn suggest_block(
        &self,
        block: &Block,
        options: SuggestOptions,
    ) -> Result<AddBlockResult, BlockTreeError> {
        self.suggest_internal(&block.header, Some(block), options)
    }

    /// Classical forward path with the default options.
    pub fn suggest(&self, block: &Block) -> Result<AddBlockResult, BlockTreeError> {
        self.suggest_block(block, SuggestOptions::SHOULD_PROCESS)
    }

    /// Header-only classical suggestion. Moves at most the best suggested header.
    pub fn suggest_header(&self, header: &BlockHeader) -> Result<AddBlockResult, BlockTreeError> {
        self.suggest_internal(header, None, SuggestOptions::empty())
    }

    fn suggest_internal(
        &self,
        header: &BlockHeader,
        block: Option<&Block>,
        options: SuggestOptions,
    ) -> Result<AddBlockResult, BlockTreeError> {
        let hash = header.hash();
        let number = header.number;

        let notification = {
            let mut pointers = self.pointers.write();
            let existing = self
                .levels
                .load_level(number)?
                .and_then(|level| level.find_block_info(&hash).cloned());
            if existing.as_ref().is_some_and(|info| !info.is_beacon_info()) {
                return Ok(AddBlockResult::AlreadyKnown);
            }

            let mut parent_is_classical = false;
            let computed = if header.is_genesis() {
                if pointers.genesis.as_ref().is_some_and(|genesis| genesis.hash() != hash) {
                    warn!(hash = %hash, "Rejected a second genesis block");
                    return Ok(AddBlockResult::InvalidBlock);
                }
                header.total_difficulty.unwrap_or(header.difficulty)
            } else {
                let parent = self.levels.load_level(number - 1)?.and_then(|level| {
                    level.find_block_info(&header.parent_hash).cloned()
                });
                let Some(parent) = parent else {
                    debug!(number, hash = %short_hash(&hash), "Suggested block has unknown parent");
                    return Ok(AddBlockResult::InvalidBlock);
                };
                parent_is_classical = !parent.is_beacon_info();

                match parent.total_difficulty.filter(|td| !td.is_zero()) {
                    Some(parent_td) => parent_td + header.difficulty,
                    None if options.contains(SuggestOptions::FILL_BEACON_BLOCK) => {
                        header.total_difficulty.unwrap_or(U256::ZERO)
                    }
                    None => {
                        debug!(
                            number,
                            hash = %short_hash(&hash),
                            "Suggested block parent has no total difficulty"
                        );
                        return Ok(AddBlockResult::InvalidBlock);
                    }
                }
            };

            let total_difficulty = match existing.as_ref().and_then(|info| info.total_difficulty) {
                Some(stored) if !stored.is_zero() => stored,
                _ => computed,
            };

            if let Some(block) = block {
                self.stores.blocks.set(hash.as_slice(), encode(block)?)?;
            }
            self.stores.headers.set(hash.as_slice(), encode(header)?)?;

            let force = options.contains(SuggestOptions::FORCE_SET_AS_MAIN);
            let mut level = self.levels.load_level(number)?.unwrap_or_default();
            let index = match level.find_index(&hash) {
                Some(index) => {
                    let info = &mut level.block_infos[index];
                    info.metadata
                        .remove(BlockMetadata::BEACON_HEADER | BlockMetadata::BEACON_BODY);
                    info.total_difficulty = Some(total_difficulty);
                    index
                }
                None => {
                    level
                        .block_infos
                        .push(BlockInfo::new(hash, number, Some(total_difficulty)));
                    level.block_infos.len() - 1
                }
            };
            if force {
                level.set_main_chain_index(index);
            }
            self.levels.persist_level(number, &level)?;

            pointers.best_known_number = pointers.best_known_number.max(number);

            let header = header.clone().with_total_difficulty(Some(total_difficulty));
            let is_best = header.is_genesis()
                || (parent_is_classical
                    && (force || self.best_suggested_improvement(&pointers, &header)));

            let mut notification = None;
            if is_best {
                if header.is_genesis() {
                    pointers.genesis = Some(header.clone());
                }
                pointers.best_suggested_header = Some(header.clone());
                if let Some(block) = block.filter(|_| options.contains(SuggestOptions::SHOULD_PROCESS)) {
                    let block = Block::new(header.clone(), block.body.clone());
                    pointers.best_suggested_body = Some(block.clone());
                    notification = Some(block);
                }
                debug!(
                    number,
                    hash = %short_hash(&hash),
                    total_difficulty = %total_difficulty,
                    "New best suggested block"
                );
            }
            notification
        };

        if let Some(block) = notification {
            let _ = self.new_best_suggested.send(block);
        }
        Ok(AddBlockResult::Added)
    }

    fn best_suggested_improvement(&self, pointers: &ChainPointers, header: &BlockHeader) -> bool {
        if pointers.best_suggested_header.is_none() {
            return true;
        }
        let baseline = ImprovementBaseline {
            total_difficulty: pointers
                .best_suggested_body
                .as_ref()
                .and_then(Block::total_difficulty)
                .unwrap_or_default(),
            number: pointers.best_suggested_body.as_ref().map_or(0, Block::number),
            head_is_pos: pointers.head.as_ref().is_some_and(|head| head.header.is_pos()),
        };
        improvement_requirements_satisfied(header, self.spec.terminal_total_difficulty(), baseline)
    }

    fn head_improvement(&self, head: Option<&Block>, header: &BlockHeader) -> bool {
        let Some(head) = head else {
            return true;
        };
        let baseline = ImprovementBaseline {
            total_difficulty: head.total_difficulty().unwrap_or_default(),
            number: head.number(),
            head_is_pos: head.header.is_pos(),
        };
        improvement_requirements_satisfied(header, self.spec.terminal_total_difficulty(), baseline)
    }

    /// Moves `blocks` to the main chain, clearing levels above the new tip
    /// when the previous head was higher. Beacon main chain membership only
    /// moves with `force_change_beacon`.
    ///
    /// Every level is staged first; nothing is written unless all blocks
    /// are known and every new head has a total difficulty.
    pub fn update_main_chain(
        &self,
        blocks: &[Block],
        were_processed: bool,
        force_change_beacon: bool,
    ) -> Result<(), BlockTreeError> {
        let Some(last_number) = blocks.iter().map(Block::number).max() else {
            return Ok(());
        };

        let new_head = {
            let mut pointers = self.pointers.write();
            let mut staged: BTreeMap<BlockNumber, ChainLevelInfo> = BTreeMap::new();

            let previous_head_number = pointers.head.as_ref().map_or(0, Block::number);
            for number in (last_number + 1..=previous_head_number).rev() {
                if let Some(mut level) = self.levels.load_level(number)? {
                    if level.has_block_on_main_chain() {
                        level.clear_main_chain();
                        staged.insert(number, level);
                    }
                }
            }

            let mut head = pointers.head.clone();
            let mut genesis = None;
            let mut head_moved = false;
            for block in blocks {
                let hash = block.hash();
                let number = block.number();
                let unknown = || BlockTreeError::UnknownBlock { number, hash };

                let mut level = match staged.remove(&number) {
                    Some(level) => level,
                    None => self.levels.load_level(number)?.ok_or_else(unknown)?,
                };
                let index = level.find_index(&hash).ok_or_else(unknown)?;
                level.block_infos[index].was_processed = were_processed;
                let total_difficulty = block
                    .total_difficulty()
                    .or(level.block_infos[index].total_difficulty);
                level.set_main_chain_index(index);
                if force_change_beacon {
                    level.set_beacon_main_chain(0);
                }
                staged.insert(number, level);

                let header = block.header.clone().with_total_difficulty(total_difficulty);
                if force_change_beacon
                    || block.is_genesis()
                    || self.head_improvement(head.as_ref(), &header)
                {
                    if total_difficulty.is_none() {
                        return Err(BlockTreeError::HeadWithoutTotalDifficulty { hash });
                    }
                    if block.is_genesis() {
                        genesis = Some(header.clone());
                    }
                    if were_processed {
                        head = Some(Block::new(header, block.body.clone()));
                        head_moved = true;
                    }
                }
            }

            for (number, level) in &staged {
                self.levels.persist_level(*number, level)?;
            }
            if let Some(genesis) = genesis {
                pointers.genesis = Some(genesis);
            }
            match head {
                Some(head) if head_moved => {
                    self.stores
                        .metadata
                        .set(MetadataKey::HeadHash.as_bytes(), head.hash().to_vec())?;
                    pointers.head = Some(head.clone());
                    Some(head)
                }
                _ => None,
            }
        };

        if let Some(head) = new_head {
            debug!(number = head.number(), hash = %short_hash(&head.hash()), "New head block");
            let _ = self.new_head.send(head);
        }
        Ok(())
    }

    /// Makes `block_infos` the beacon main chain, clearing beacon membership
    /// of the levels between the last supplied block and `clear_from`.
    pub fn update_beacon_main_chain(
        &self,
        block_infos: &[BlockInfo],
        clear_from: BlockNumber,
    ) -> Result<(), BlockTreeError> {
        let Some(last) = block_infos.last() else {
            return Ok(());
        };

        let _pointers = self.pointers.write();
        for number in (last.block_number + 1..=clear_from).rev() {
            if let Some(mut level) = self.levels.load_level(number)? {
                level.clear_beacon_main_chain();
                self.levels.persist_level(number, &level)?;
            }
        }

        for info in block_infos {
            let mut level = self
                .levels
                .load_level(info.block_number)?
                .unwrap_or_default();
            let (index, inserted) = level.insert_or_get(info.clone());
            if !inserted {
                merge_block_info(&mut level.block_infos[index], info);
            }
            level.set_beacon_main_chain(index);
            self.levels.persist_level(info.block_number, &level)?;
        }

        debug!(
            from = block_infos[0].block_number,
            to = last.block_number,
            clear_from,
            "Updated beacon main chain"
        );
        Ok(())
    }

    /// Records that `blocks` were processed without changing main chain membership.
    pub fn mark_chain_as_processed(&self, blocks: &[Block]) -> Result<(), BlockTreeError> {
        let _pointers = self.pointers.write();
        for block in blocks {
            let hash = block.hash();
            let number = block.number();
            let mut level = self
                .levels
                .load_level(number)?
                .ok_or(BlockTreeError::UnknownBlock { number, hash })?;
            let info = level
                .find_block_info_mut(&hash)
                .ok_or(BlockTreeError::UnknownBlock { number, hash })?;
            info.was_processed = true;
            self.levels.persist_level(number, &level)?;
        }
        Ok(())
    }

    pub fn is_terminal_block(&self, header: &BlockHeader) -> bool {
        header.is_terminal_block(self.spec.terminal_total_difficulty())
    }

    pub fn find_level(&self, number: BlockNumber) -> Result<Option<ChainLevelInfo>, BlockTreeError> {
        Ok(self.levels.load_level(number)?)
    }

    pub fn find_block_info(
        &self,
        number: BlockNumber,
        hash: &Hash256,
    ) -> Result<Option<BlockInfo>, BlockTreeError> {
        Ok(self
            .levels
            .load_level(number)?
            .and_then(|level| level.find_block_info(hash).cloned()))
    }

    pub fn is_known_block(&self, number: BlockNumber, hash: &Hash256) -> Result<bool, BlockTreeError> {
        Ok(self.find_block_info(number, hash)?.is_some())
    }

    pub fn was_processed(&self, number: BlockNumber, hash: &Hash256) -> Result<bool, BlockTreeError> {
        Ok(self
            .find_block_info(number, hash)?
            .is_some_and(|info| info.was_processed))
    }

    pub fn is_main_chain(&self, header: &BlockHeader) -> Result<bool, BlockTreeError> {
        let hash = header.hash();
        Ok(self
            .levels
            .load_level(header.number)?
            .and_then(|level| level.main_chain_block().map(|info| info.block_hash))
            == Some(hash))
    }

    pub fn is_main_chain_hash(&self, hash: &Hash256) -> Result<bool, BlockTreeError> {
        match self.raw_header(hash)? {
            Some(header) => self.is_main_chain(&header),
            None => Ok(false),
        }
    }

    pub fn find_header(
        &self,
        hash: &Hash256,
        options: LookupOptions,
    ) -> Result<Option<BlockHeader>, BlockTreeError> {
        let Some(mut header) = self.raw_header(hash)? else {
            return Ok(None);
        };
        Ok(self.annotate(&mut header, options)?.then_some(header))
    }

    pub fn find_block(
        &self,
        hash: &Hash256,
        options: LookupOptions,
    ) -> Result<Option<Block>, BlockTreeError> {
        let Some(mut block) = self.raw_block(hash)? else {
            return Ok(None);
        };
        Ok(self.annotate(&mut block.header, options)?.then_some(block))
    }

    /// Main chain header at `number`, falling back to the heaviest candidate
    /// unless `REQUIRE_CANONICAL` is given.
    pub fn find_header_by_number(
        &self,
        number: BlockNumber,
        options: LookupOptions,
    ) -> Result<Option<BlockHeader>, BlockTreeError> {
        match self.hash_at(number, options)? {
            Some(hash) => self.find_header(&hash, options),
            None => Ok(None),
        }
    }

    pub fn find_block_by_number(
        &self,
        number: BlockNumber,
        options: LookupOptions,
    ) -> Result<Option<Block>, BlockTreeError> {
        match self.hash_at(number, options)? {
            Some(hash) => self.find_block(&hash, options),
            None => Ok(None),
        }
    }

    pub fn find_parent_header(
        &self,
        header: &BlockHeader,
        options: LookupOptions,
    ) -> Result<Option<BlockHeader>, BlockTreeError> {
        if header.is_genesis() {
            return Ok(None);
        }
        self.find_header(&header.parent_hash, options)
    }

    fn hash_at(
        &self,
        number: BlockNumber,
        options: LookupOptions,
    ) -> Result<Option<Hash256>, BlockTreeError> {
        let Some(level) = self.levels.load_level(number)? else {
            return Ok(None);
        };
        let info = if options.contains(LookupOptions::REQUIRE_CANONICAL) {
            level.main_chain_block()
        } else {
            level.main_or_heaviest()
        };
        Ok(info.map(|info| info.block_hash))
    }

    /// Fills the total difficulty of a stored header from its level.
    ///
    /// Returns `false` when the header does not satisfy `REQUIRE_CANONICAL`.
    fn annotate(&self, header: &mut BlockHeader, options: LookupOptions) -> Result<bool, BlockTreeError> {
        let hash = header.hash();
        {
            let _pointers = self.pointers.read();
            let level = self.levels.load_level(header.number)?;
            if let Some(level) = &level {
                if let Some(index) = level.find_index(&hash) {
                    if options.contains(LookupOptions::REQUIRE_CANONICAL)
                        && level.main_chain_index != Some(index)
                    {
                        return Ok(false);
                    }
                    header.total_difficulty = level.block_infos[index].total_difficulty;
                    return Ok(true);
                }
            }
            if options.contains(LookupOptions::REQUIRE_CANONICAL) {
                return Ok(false);
            }
            if options.intersects(
                LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED
                    | LookupOptions::DO_NOT_CREATE_LEVEL_IF_MISSING,
            ) {
                header.total_difficulty = None;
                return Ok(true);
            }
        }

        let pointers = self.pointers.write();
        let level = self.levels.load_level(header.number)?;
        if let Some(info) = level.as_ref().and_then(|level| level.find_block_info(&hash)) {
            header.total_difficulty = info.total_difficulty;
            return Ok(true);
        }

        match self.link_ancestry(header)? {
            Some(total_difficulty) => {
                header.total_difficulty = Some(total_difficulty);
                Ok(true)
            }
            None if pointers.lowest_inserted_beacon_header.is_some()
                || level.as_ref().is_some_and(ChainLevelInfo::has_beacon_block) =>
            {
                header.total_difficulty = None;
                Ok(true)
            }
            None => {
                warn!(number = header.number, hash = %hash, "Found dangling block");
                Err(BlockTreeError::DanglingBlock {
                    number: header.number,
                    hash,
                })
            }
        }
    }

    /// Walks stored parents of `header` back to an ancestor with a known
    /// total difficulty and records infos for every block on the way.
    fn link_ancestry(&self, header: &BlockHeader) -> Result<Option<U256>, BlockTreeError> {
        let mut unlinked = Vec::new();
        let mut current = header.clone();
        let mut total_difficulty = loop {
            if current.is_genesis() {
                unlinked.push(current);
                break U256::ZERO;
            }

            let parent_info = self.levels.load_level(current.number - 1)?.and_then(|level| {
                level.find_block_info(&current.parent_hash).cloned()
            });
            if let Some(parent_info) = parent_info {
                match parent_info.total_difficulty.filter(|td| !td.is_zero()) {
                    Some(parent_td) => {
                        unlinked.push(current);
                        break parent_td;
                    }
                    None => return Ok(None),
                }
            }

            let Some(parent) = self.raw_header(&current.parent_hash)? else {
                return Ok(None);
            };
            unlinked.push(std::mem::replace(&mut current, parent));
        };

        for missing in unlinked.iter().rev() {
            total_difficulty += missing.difficulty;
            let info = BlockInfo::new(missing.hash(), missing.number, Some(total_difficulty));
            self.update_or_create_level(info, false, false)?;
        }
        debug!(
            number = header.number,
            linked = unlinked.len(),
            "Linked stored ancestry to known levels"
        );
        Ok(Some(total_difficulty))
    }

    fn raw_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, StoreError> {
        if let Some(bytes) = self.stores.headers.get(hash.as_slice())? {
            return decode(&bytes).map(Some);
        }
        Ok(self.raw_block(hash)?.map(|block| block.header))
    }

    fn raw_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        self.stores
            .blocks
            .get(hash.as_slice())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn annotated_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, BlockTreeError> {
        let Some(header) = self.raw_header(hash)? else {
            return Ok(None);
        };
        let total_difficulty = self
            .find_block_info(header.number, hash)?
            .and_then(|info| info.total_difficulty);
        Ok(Some(header.with_total_difficulty(total_difficulty)))
    }

    fn annotated_block(&self, hash: &Hash256) -> Result<Option<Block>, BlockTreeError> {
        let Some(mut block) = self.raw_block(hash)? else {
            return Ok(None);
        };
        block.header.total_difficulty = self
            .find_block_info(block.number(), hash)?
            .and_then(|info| info.total_difficulty);
        Ok(Some(block))
    }

    fn metadata_hash(&self, key: MetadataKey) -> Result<Option<Hash256>, BlockTreeError> {
        Ok(self
            .stores
            .metadata
            .get(key.as_bytes())?
            .map(|bytes| decode_hash(key, &bytes))
            .transpose()?)
    }

    /// Beacon sync pivot persisted in the metadata store.
    pub fn beacon_pivot(&self) -> Result<Option<Checkpoint>, BlockTreeError> {
        let Some(number) = self
            .stores
            .metadata
            .get(MetadataKey::BeaconSyncPivotNumber.as_bytes())?
        else {
            return Ok(None);
        };
        let number = decode_number(MetadataKey::BeaconSyncPivotNumber, &number)?;
        Ok(self
            .metadata_hash(MetadataKey::BeaconSyncPivotHash)?
            .map(|hash| Checkpoint::new(hash, number)))
    }

    pub fn set_beacon_pivot(&self, pivot: Checkpoint) -> Result<(), BlockTreeError> {
        let metadata = &self.stores.metadata;
        metadata.set(
            MetadataKey::BeaconSyncPivotNumber.as_bytes(),
            pivot.number.to_be_bytes().to_vec(),
        )?;
        metadata.set(
            MetadataKey::BeaconSyncPivotHash.as_bytes(),
            pivot.hash.to_vec(),
        )?;
        Ok(())
    }

    pub fn remove_beacon_pivot(&self) -> Result<(), BlockTreeError> {
        let metadata = &self.stores.metadata;
        metadata.delete(MetadataKey::BeaconSyncPivotNumber.as_bytes())?;
        metadata.delete(MetadataKey::BeaconSyncPivotHash.as_bytes())?;
        Ok(())
    }

    fn load_pointers(&self, search_limit: u64) -> Result<ChainPointers, BlockTreeError> {
        let mut pointers = ChainPointers::default();

        if let Some(genesis) = self.levels.load_level(0)?.as_ref().and_then(ChainLevelInfo::main_or_heaviest) {
            pointers.genesis = self.annotated_header(&genesis.block_hash)?;
        }
        if let Some(hash) = self.metadata_hash(MetadataKey::HeadHash)? {
            pointers.head = self.annotated_block(&hash)?;
        }
        if let Some(hash) = self.metadata_hash(MetadataKey::LowestInsertedHeaderHash)? {
            pointers.lowest_inserted_header = self.annotated_header(&hash)?;
        }
        if let Some(hash) = self.metadata_hash(MetadataKey::LowestInsertedBeaconHeaderHash)? {
            pointers.lowest_inserted_beacon_header = self.annotated_header(&hash)?;
        }

        let head_number = pointers.head.as_ref().map_or(0, Block::number);
        let left = pointers
            .lowest_inserted_header
            .as_ref()
            .map_or(0, |header| header.number)
            .max(head_number);
        let right = left.saturating_add(search_limit);

        pointers.best_known_number = search_highest(left, right, |number| {
            Ok::<_, BlockTreeError>(self.find_info_at(number, |_| Ok(true), Candidate::Classical)?.is_some())
        })?
        .unwrap_or(0);

        let best_header = search_highest(left, right, |number| {
            Ok::<_, BlockTreeError>(self.header_at(number, Candidate::Classical)?.is_some())
        })?;
        if let Some(number) = best_header {
            pointers.best_suggested_header = self.header_at(number, Candidate::Classical)?;
        }

        let best_body = search_highest(left, right, |number| {
            Ok::<_, BlockTreeError>(self.block_at(number, Candidate::Classical)?.is_some())
        })?;
        if let Some(number) = best_body {
            pointers.best_suggested_body = self.block_at(number, Candidate::Classical)?;
        }

        if let Some(pivot) = self.beacon_pivot()? {
            let left = pivot.number;
            let right = left.saturating_add(search_limit);

            pointers.best_known_beacon_number = search_highest(left, right, |number| {
                Ok::<_, BlockTreeError>(self.find_info_at(number, |_| Ok(true), Candidate::Beacon)?.is_some())
            })?;

            let best_header = search_highest(left, right, |number| {
                Ok::<_, BlockTreeError>(self.header_at(number, Candidate::Beacon)?.is_some())
            })?;
            if let Some(number) = best_header {
                pointers.best_suggested_beacon_header = self.header_at(number, Candidate::Beacon)?;
            }

            let best_body = search_highest(left, right, |number| {
                Ok::<_, BlockTreeError>(self.block_at(number, Candidate::Beacon)?.is_some())
            })?;
            if let Some(number) = best_body {
                pointers.best_suggested_beacon_body = self.block_at(number, Candidate::Beacon)?;
            }
        }

        Ok(pointers)
    }

    /// First info at `number` of the given kind accepted by `accept`,
    /// preferring the main chain entry.
    fn find_info_at(
        &self,
        number: BlockNumber,
        mut accept: impl FnMut(&BlockInfo) -> Result<bool, BlockTreeError>,
        kind: Candidate,
    ) -> Result<Option<BlockInfo>, BlockTreeError> {
        let Some(level) = self.levels.load_level(number)? else {
            return Ok(None);
        };
        let mut candidates: Vec<&BlockInfo> = level.main_chain_block().into_iter().collect();
        candidates.extend(level.block_infos.iter());
        for info in candidates {
            if kind.matches(info) && accept(info)? {
                return Ok(Some(info.clone()));
            }
        }
        Ok(None)
    }

    fn header_at(&self, number: BlockNumber, kind: Candidate) -> Result<Option<BlockHeader>, BlockTreeError> {
        let mut found = None;
        self.find_info_at(
            number,
            |info| {
                found = self.annotated_header(&info.block_hash)?;
                Ok(found.is_some())
            },
            kind,
        )?;
        Ok(found)
    }

    fn block_at(&self, number: BlockNumber, kind: Candidate) -> Result<Option<Block>, BlockTreeError> {
        let mut found = None;
        self.find_info_at(
            number,
            |info| {
                found = self.annotated_block(&info.block_hash)?;
                Ok(found.is_some())
            },
            kind,
        )?;
        Ok(found)
    }
}

#[derive(Clone, Copy, Debug)]
enum Candidate {
    Classical,
    Beacon,
}

impl Candidate {
    fn matches(self, info: &BlockInfo) -> bool {
        match self {
            Self::Classical => !info.is_beacon_info(),
            Self::Beacon => info.is_beacon_info() || info.is_beacon_main_chain(),
        }
    }
}

/// Merges a re-inserted record into the stored one.
///
/// A stored total difficulty is never replaced, only filled. Beacon
/// provenance is not added to blocks that were already suggested classically.
fn merge_block_info(stored: &mut BlockInfo, incoming: &BlockInfo) {
    if stored.total_difficulty.is_none() {
        stored.total_difficulty = incoming.total_difficulty;
    }
    let mut metadata = incoming.metadata;
    if !stored.is_beacon_info() {
        metadata.remove(BlockMetadata::BEACON_HEADER | BlockMetadata::BEACON_BODY);
    }
    stored.metadata.insert(metadata);
}
