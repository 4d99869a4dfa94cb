use crate::beacon_pivot::BeaconPivot;
use crate::chain_level_helper::{BlockDownloadContext, ChainLevelHelper};
use crate::feed::{
    AllocationContexts, FeedStateChannel, SyncDownloader, SyncFeed, SyncResponseHandlingResult,
};
use crate::peer::PeerInfo;
use crate::states::SyncFeedState;
use crate::strategies::{BlocksAvailableStrategy, PeerAllocationStrategy, PeerAllocationStrategyFactory};
use anyhow::Result;
use async_trait::async_trait;
use block_tree::{BlockTree, BlockTreeError};
use chain::SyncConfig;
use containers::{AddBlockResult, Block, Hash256, SuggestOptions};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

pub const BEACON_BODIES_FEED: &str = "beacon_bodies";

const BEACON_SUGGEST_OPTIONS: SuggestOptions = SuggestOptions::SHOULD_PROCESS
    .union(SuggestOptions::FILL_BEACON_BLOCK)
    .union(SuggestOptions::FORCE_SET_AS_MAIN);

#[derive(Debug, Clone)]
pub struct BodiesSyncBatch {
    pub context: BlockDownloadContext,
}

/// Fills bodies forward from the local head along the beacon main chain
/// and moves the completed blocks to the main chain.
pub struct BeaconBodiesSyncFeed {
    tree: Arc<BlockTree>,
    pivot: Arc<BeaconPivot>,
    helper: ChainLevelHelper,
    max_bodies_per_request: usize,
    state: FeedStateChannel,
}

impl BeaconBodiesSyncFeed {
    pub fn new(tree: Arc<BlockTree>, pivot: Arc<BeaconPivot>, config: &SyncConfig) -> Self {
        Self {
            helper: ChainLevelHelper::new(tree.clone(), pivot.clone()),
            tree,
            pivot,
            max_bodies_per_request: config.max_bodies_per_request.max(1),
            state: FeedStateChannel::new(BEACON_BODIES_FEED),
        }
    }

    pub fn activate(&self) -> Result<(), BlockTreeError> {
        if !self.pivot.beacon_pivot_exists() {
            debug!("No beacon pivot, body sync finished");
            self.state.finish();
            return Ok(());
        }
        if self.pivot_reached() {
            return self.complete();
        }

        info!(
            from = self.tree.best_known_number() + 1,
            pivot = self.pivot.pivot_number(),
            "Starting beacon body sync"
        );
        self.state.activate();
        Ok(())
    }

    fn pivot_reached(&self) -> bool {
        self.pivot.beacon_pivot_exists()
            && self
                .tree
                .best_suggested_body()
                .is_some_and(|block| block.number() >= self.pivot.pivot_number())
    }

    fn complete(&self) -> Result<(), BlockTreeError> {
        info!(pivot = self.pivot.pivot_number(), "Beacon sync reached the pivot");
        self.pivot.remove_beacon_pivot()?;
        self.state.finish();
        Ok(())
    }

    fn plan(&self) -> Result<Option<BodiesSyncBatch>, BlockTreeError> {
        if self.pivot_reached() {
            self.complete()?;
            return Ok(None);
        }

        let Some(headers) = self
            .helper
            .get_next_headers(self.max_bodies_per_request + 1, self.pivot.pivot_number())?
        else {
            return Ok(None);
        };
        // The first header is the anchor, already on the local chain.
        let headers: Vec<_> = headers.into_iter().skip(1).collect();
        if headers.is_empty() {
            return Ok(None);
        }

        let mut context = BlockDownloadContext::new(headers);
        let local = self
            .helper
            .try_set_next_blocks(self.max_bodies_per_request, &mut context)?;
        trace!(
            from = context.headers().first().map(|header| header.number),
            count = context.len(),
            local,
            "Prepared body batch"
        );
        Ok(Some(BodiesSyncBatch { context }))
    }

    /// Suggests `blocks` in order and moves the accepted prefix to the main
    /// chain. Returns how many were accepted.
    fn process(&self, blocks: &[Block]) -> Result<usize, BlockTreeError> {
        let mut accepted = Vec::with_capacity(blocks.len());
        for block in blocks {
            match self.tree.suggest_block(block, BEACON_SUGGEST_OPTIONS)? {
                AddBlockResult::Added | AddBlockResult::AlreadyKnown => accepted.push(block.clone()),
                AddBlockResult::InvalidBlock => {
                    warn!(number = block.number(), hash = %block.hash(), "Rejected beacon block");
                    break;
                }
            }
        }

        if !accepted.is_empty() {
            self.tree.update_main_chain(&accepted, true, false)?;
        }
        if self.pivot_reached() {
            self.complete()?;
        }
        Ok(accepted.len())
    }
}

#[async_trait]
impl SyncFeed<BodiesSyncBatch> for BeaconBodiesSyncFeed {
    fn state_channel(&self) -> &FeedStateChannel {
        &self.state
    }

    fn contexts(&self) -> AllocationContexts {
        AllocationContexts::BODIES
    }

    fn is_multi_feed(&self) -> bool {
        false
    }

    async fn prepare_request(&self) -> Option<BodiesSyncBatch> {
        if self.current_state() != SyncFeedState::Active {
            return None;
        }
        match self.plan() {
            Ok(batch) => batch,
            Err(error) => {
                error!(error = %error, "Failed to plan body download");
                None
            }
        }
    }

    async fn handle_response(
        &self,
        batch: BodiesSyncBatch,
        peer: Option<&PeerInfo>,
    ) -> SyncResponseHandlingResult {
        if self.current_state() == SyncFeedState::Finished {
            return SyncResponseHandlingResult::Ignored;
        }

        let blocks = batch.context.blocks();
        if blocks.is_empty() {
            return match peer {
                Some(_) => SyncResponseHandlingResult::NoProgress,
                None => SyncResponseHandlingResult::NotAssigned,
            };
        }

        match self.process(&blocks) {
            Ok(accepted) if accepted < blocks.len() => match peer {
                Some(_) => SyncResponseHandlingResult::LesserQuality,
                None => SyncResponseHandlingResult::InternalError,
            },
            Ok(_) if blocks.len() < batch.context.len() => SyncResponseHandlingResult::Emptish,
            Ok(_) => SyncResponseHandlingResult::Ok,
            Err(error) => {
                error!(error = %error, "Failed to process beacon blocks");
                SyncResponseHandlingResult::InternalError
            }
        }
    }
}

pub struct BeaconBodiesDownloader;

#[async_trait]
impl SyncDownloader<BodiesSyncBatch> for BeaconBodiesDownloader {
    async fn dispatch(&self, peer: &PeerInfo, batch: &mut BodiesSyncBatch) -> Result<()> {
        if batch.context.is_complete() {
            return Ok(());
        }

        let missing = batch.context.missing();
        let hashes: Vec<Hash256> = missing.iter().map(|(_, hash)| *hash).collect();
        let bodies = peer.peer.get_block_bodies(&hashes).await?;
        for ((index, _), body) in missing.into_iter().zip(bodies) {
            if let Some(body) = body {
                batch.context.set_body(index, body);
            }
        }
        Ok(())
    }
}

/// Only peers whose head covers the whole batch are asked.
pub struct BodiesAllocationStrategyFactory;

impl PeerAllocationStrategyFactory<BodiesSyncBatch> for BodiesAllocationStrategyFactory {
    fn create(&self, batch: &BodiesSyncBatch) -> Box<dyn PeerAllocationStrategy> {
        Box::new(BlocksAvailableStrategy {
            min_number: batch
                .context
                .headers()
                .last()
                .map_or(0, |header| header.number),
        })
    }
}
