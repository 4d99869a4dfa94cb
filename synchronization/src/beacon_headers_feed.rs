use crate::beacon_pivot::BeaconPivot;
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
use containers::{BlockHeader, BlockNumber, InsertHeaderOptions, LookupOptions};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const BEACON_HEADERS_FEED: &str = "beacon_headers";

/// Descending header range `[start_number - count + 1, start_number]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersSyncBatch {
    pub start_number: BlockNumber,
    pub count: usize,
    pub response: Option<Vec<BlockHeader>>,
}

impl HeadersSyncBatch {
    pub fn new(start_number: BlockNumber, count: usize) -> Self {
        Self {
            start_number,
            count,
            response: None,
        }
    }

    pub fn end_number(&self) -> BlockNumber {
        (self.start_number + 1).saturating_sub(self.count as u64)
    }
}

#[derive(Debug)]
struct HeadersProgress {
    /// Lowest header linked to the pivot so far.
    lowest: BlockHeader,
    /// Highest number not requested yet.
    next_start: Option<BlockNumber>,
    in_flight: usize,
    /// Downloaded batches waiting for the batch above them, by start number.
    pending: BTreeMap<BlockNumber, Vec<BlockHeader>>,
    retry: VecDeque<HeadersSyncBatch>,
}

impl HeadersProgress {
    fn new(lowest: BlockHeader) -> Self {
        Self {
            next_start: lowest.number.checked_sub(1),
            lowest,
            in_flight: 0,
            pending: BTreeMap::new(),
            retry: VecDeque::new(),
        }
    }
}

/// Downloads headers backwards from the pivot until they link to a
/// classical block of the local chain.
///
/// Batches are requested concurrently and inserted in descending order as
/// soon as the batch above them is linked.
pub struct BeaconHeadersSyncFeed {
    tree: Arc<BlockTree>,
    pivot: Arc<BeaconPivot>,
    max_headers_per_request: usize,
    state: FeedStateChannel,
    progress: Mutex<Option<HeadersProgress>>,
}

impl BeaconHeadersSyncFeed {
    pub fn new(tree: Arc<BlockTree>, pivot: Arc<BeaconPivot>, config: &SyncConfig) -> Self {
        Self {
            tree,
            pivot,
            max_headers_per_request: config.max_headers_per_request.max(1),
            state: FeedStateChannel::new(BEACON_HEADERS_FEED),
            progress: Mutex::new(None),
        }
    }

    /// Resumes from the lowest inserted beacon header when it lies between
    /// the destination and the pivot and is an ancestor of the pivot,
    /// otherwise starts at the pivot.
    pub fn activate(&self) -> Result<(), BlockTreeError> {
        let Some(pivot) = self.pivot.pivot_header() else {
            debug!("No beacon pivot, header sync stays dormant");
            return Ok(());
        };
        let destination = self.pivot.pivot_destination_number();
        let resumable = match self.tree.lowest_inserted_beacon_header() {
            Some(lowest) if lowest.number >= destination && lowest.number <= pivot.number => {
                if self.is_ancestor(&lowest, &pivot)? {
                    Some(lowest)
                } else {
                    info!(
                        lowest = lowest.number,
                        pivot = pivot.number,
                        "Lowest beacon header is on another fork, restarting from the pivot"
                    );
                    None
                }
            }
            _ => None,
        };
        let lowest = resumable.unwrap_or(pivot);

        if self.is_linked(&lowest)? {
            info!(lowest = lowest.number, "Beacon headers already linked");
            self.state.finish();
            return Ok(());
        }

        info!(from = lowest.number, destination, "Starting beacon header sync");
        *self.progress.lock() = Some(HeadersProgress::new(lowest));
        self.state.activate();
        Ok(())
    }

    /// Walks parent links down from `descendant` to the height of `ancestor`.
    fn is_ancestor(
        &self,
        ancestor: &BlockHeader,
        descendant: &BlockHeader,
    ) -> Result<bool, BlockTreeError> {
        let target = ancestor.hash();
        let mut current = descendant.clone();
        while current.number > ancestor.number {
            match self
                .tree
                .find_parent_header(&current, LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED)?
            {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
        Ok(current.number == ancestor.number && current.hash() == target)
    }

    fn is_linked(&self, lowest: &BlockHeader) -> Result<bool, BlockTreeError> {
        if lowest.is_genesis() {
            return Ok(true);
        }
        Ok(self
            .tree
            .find_block_info(lowest.number - 1, &lowest.parent_hash)?
            .is_some_and(|info| !info.is_beacon_info()))
    }

    fn next_batch(&self, progress: &mut HeadersProgress) -> Option<HeadersSyncBatch> {
        if let Some(batch) = progress.retry.pop_front() {
            return Some(batch);
        }

        let next = progress.next_start?;
        let destination = self.pivot.pivot_destination_number();
        let lower = if next >= destination {
            destination
        } else if progress.in_flight > 0 || !progress.pending.is_empty() {
            // Everything down to the destination is requested. Only go
            // deeper once it turned out not to link.
            return None;
        } else {
            0
        };

        let count = (next - lower + 1).min(self.max_headers_per_request as u64) as usize;
        let batch = HeadersSyncBatch::new(next, count);
        progress.next_start = batch.end_number().checked_sub(1);
        Some(batch)
    }

    /// Inserts every pending batch that links to the lowest header. Returns
    /// the start of a batch that failed to link, which is queued again.
    fn link_pending(
        &self,
        progress: &mut HeadersProgress,
    ) -> Result<Option<BlockNumber>, BlockTreeError> {
        while !progress.lowest.is_genesis() {
            let expected = progress.lowest.number - 1;
            let Some(headers) = progress.pending.remove(&expected) else {
                break;
            };
            let Some(top) = headers.first() else {
                break;
            };
            if top.hash() != progress.lowest.parent_hash {
                warn!(
                    number = expected,
                    hash = %top.hash(),
                    expected = %progress.lowest.parent_hash,
                    "Header batch does not link to the beacon chain"
                );
                progress
                    .retry
                    .push_back(HeadersSyncBatch::new(expected, headers.len()));
                return Ok(Some(expected));
            }

            for header in &headers {
                let header = header.clone().with_total_difficulty(None);
                self.tree.insert_header(
                    &header,
                    InsertHeaderOptions::BEACON_HEADER_INSERT
                        | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
                )?;
            }
            if let Some(lowest) = headers.last() {
                debug!(from = expected, to = lowest.number, "Inserted beacon headers");
                progress.lowest = lowest.clone();
            }
        }
        Ok(None)
    }
}

/// Headers descend one by one from `start` and each links to the next.
fn is_descending_chain(headers: &[BlockHeader], start: BlockNumber) -> bool {
    headers.first().is_some_and(|first| first.number == start)
        && headers.windows(2).all(|pair| {
            pair[1].number + 1 == pair[0].number && pair[0].parent_hash == pair[1].hash()
        })
}

#[async_trait]
impl SyncFeed<HeadersSyncBatch> for BeaconHeadersSyncFeed {
    fn state_channel(&self) -> &FeedStateChannel {
        &self.state
    }

    fn contexts(&self) -> AllocationContexts {
        AllocationContexts::HEADERS
    }

    fn is_multi_feed(&self) -> bool {
        true
    }

    async fn prepare_request(&self) -> Option<HeadersSyncBatch> {
        if self.current_state() != SyncFeedState::Active {
            return None;
        }
        let mut guard = self.progress.lock();
        let progress = guard.as_mut()?;
        let batch = self.next_batch(progress)?;
        progress.in_flight += 1;
        Some(batch)
    }

    async fn handle_response(
        &self,
        mut batch: HeadersSyncBatch,
        peer: Option<&PeerInfo>,
    ) -> SyncResponseHandlingResult {
        let mut guard = self.progress.lock();
        let Some(progress) = guard.as_mut() else {
            return SyncResponseHandlingResult::Ignored;
        };
        progress.in_flight = progress.in_flight.saturating_sub(1);
        if self.current_state() == SyncFeedState::Finished {
            return SyncResponseHandlingResult::Ignored;
        }

        let response = batch.response.take();
        let Some(peer) = peer else {
            progress.retry.push_back(batch);
            return SyncResponseHandlingResult::NotAssigned;
        };
        let mut headers = response.unwrap_or_default();
        if headers.is_empty() {
            progress.retry.push_back(batch);
            return SyncResponseHandlingResult::NoProgress;
        }
        headers.truncate(batch.count);
        if !is_descending_chain(&headers, batch.start_number) {
            warn!(peer = %peer.id, start = batch.start_number, "Peer sent unlinked headers");
            progress.retry.push_back(batch);
            return SyncResponseHandlingResult::LesserQuality;
        }

        let received = headers.len();
        if received < batch.count {
            let remainder_start = batch.start_number - received as u64;
            progress
                .retry
                .push_back(HeadersSyncBatch::new(remainder_start, batch.count - received));
        }
        progress.pending.insert(batch.start_number, headers);

        let mismatched = match self.link_pending(progress) {
            Ok(mismatched) => mismatched,
            Err(error) => {
                error!(error = %error, "Failed to insert beacon headers");
                return SyncResponseHandlingResult::InternalError;
            }
        };

        match self.is_linked(&progress.lowest) {
            Ok(true) => {
                info!(
                    lowest = progress.lowest.number,
                    "Beacon headers linked to the local chain"
                );
                progress.pending.clear();
                progress.retry.clear();
                drop(guard);
                self.state.finish();
            }
            Ok(false) => {}
            Err(error) => {
                error!(error = %error, "Failed to check beacon header linkage");
                return SyncResponseHandlingResult::InternalError;
            }
        }

        if mismatched == Some(batch.start_number) {
            SyncResponseHandlingResult::LesserQuality
        } else if received < batch.count {
            SyncResponseHandlingResult::Emptish
        } else {
            SyncResponseHandlingResult::Ok
        }
    }
}

pub struct BeaconHeadersDownloader;

#[async_trait]
impl SyncDownloader<HeadersSyncBatch> for BeaconHeadersDownloader {
    async fn dispatch(&self, peer: &PeerInfo, batch: &mut HeadersSyncBatch) -> Result<()> {
        let headers = peer
            .peer
            .get_block_headers(batch.start_number, batch.count, 0, true)
            .await?;
        batch.response = Some(headers);
        Ok(())
    }
}

/// Only peers whose head covers the top of the batch are asked.
pub struct HeadersAllocationStrategyFactory;

impl PeerAllocationStrategyFactory<HeadersSyncBatch> for HeadersAllocationStrategyFactory {
    fn create(&self, batch: &HeadersSyncBatch) -> Box<dyn PeerAllocationStrategy> {
        Box::new(BlocksAvailableStrategy {
            min_number: batch.start_number,
        })
    }
}
