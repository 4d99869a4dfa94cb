use crate::beacon_bodies_feed::{
    BeaconBodiesDownloader, BeaconBodiesSyncFeed, BodiesAllocationStrategyFactory,
    BodiesSyncBatch, BEACON_BODIES_FEED,
};
use crate::beacon_headers_feed::{
    BeaconHeadersDownloader, BeaconHeadersSyncFeed, HeadersAllocationStrategyFactory,
    HeadersSyncBatch, BEACON_HEADERS_FEED,
};
use crate::beacon_pivot::BeaconPivot;
use crate::dispatcher::SyncDispatcher;
use crate::peer::{PeerId, PeerInfo};
use crate::peer_manager::PeerManager;
use crate::states::SyncState;
use block_tree::{BlockTree, BlockTreeError};
use chain::SyncConfig;
use containers::{Block, InsertBlockOptions, InsertHeaderOptions};
use metrics::SharedMetrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Sync service coordinating a beacon sync.
///
/// The SyncService is the main entry point for synchronization. It coordinates:
/// - PeerManager: Tracking the peers dispatchers borrow
/// - BeaconPivot: The block supplied by the consensus layer
/// - Header stage: Downloading headers backwards from the pivot
/// - Body stage: Filling bodies forwards up to the pivot
pub struct SyncService {
    tree: Arc<BlockTree>,
    pivot: Arc<BeaconPivot>,
    peer_manager: Arc<PeerManager>,
    config: SyncConfig,
    metrics: Option<SharedMetrics>,
    state: Mutex<SyncState>,
}

impl SyncService {
    pub fn new(tree: Arc<BlockTree>, config: SyncConfig) -> Result<Self, BlockTreeError> {
        let pivot = Arc::new(BeaconPivot::new(tree.clone())?);
        let peer_manager = Arc::new(PeerManager::new(config.max_concurrent_requests_per_peer));
        Ok(Self {
            tree,
            pivot,
            peer_manager,
            config,
            metrics: None,
            state: Mutex::new(SyncState::default()),
        })
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get current sync state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    pub fn tree(&self) -> &Arc<BlockTree> {
        &self.tree
    }

    pub fn pivot(&self) -> &Arc<BeaconPivot> {
        &self.pivot
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    /// Add a peer to the sync service.
    pub fn add_peer(&self, info: PeerInfo) {
        let peer_id = info.id;
        let head = info.head_number;
        self.peer_manager.add_peer(info);
        self.update_peer_metrics();
        info!(peer = %peer_id, head, "Peer added to sync service");
    }

    /// Remove a peer from the sync service.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.peer_manager.remove_peer(peer_id);
        self.update_peer_metrics();
        info!(peer = %peer_id, "Peer removed from sync service");
    }

    /// Syncs the local chain up to `pivot_block`.
    ///
    /// Inserts the pivot, downloads headers down to the local chain, then
    /// fills bodies up to the pivot. Returns the state reached, which is
    /// `Synced` unless `cancel` fired first.
    pub async fn run_beacon_sync(
        &self,
        pivot_block: &Block,
        cancel: CancellationToken,
    ) -> Result<SyncState, BlockTreeError> {
        self.transition(SyncState::Headers);
        self.tree.insert_block(
            pivot_block,
            InsertBlockOptions::SAVE_HEADER,
            InsertHeaderOptions::BEACON_BLOCK_INSERT
                | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
        )?;
        self.pivot.ensure_pivot(&pivot_block.header, true)?;
        self.update_chain_metrics();

        let headers_feed = Arc::new(BeaconHeadersSyncFeed::new(
            self.tree.clone(),
            self.pivot.clone(),
            &self.config,
        ));
        headers_feed.activate()?;
        let dispatcher = self.attach_metrics(SyncDispatcher::<HeadersSyncBatch>::new(
            BEACON_HEADERS_FEED,
            headers_feed,
            Arc::new(BeaconHeadersDownloader),
            self.peer_manager.clone(),
            Arc::new(HeadersAllocationStrategyFactory),
            &self.config,
        ));
        dispatcher.start(cancel.clone()).await;
        self.update_chain_metrics();
        if cancel.is_cancelled() {
            warn!("Beacon sync cancelled during header stage");
            return Ok(self.state());
        }

        self.transition(SyncState::Bodies);
        let bodies_feed = Arc::new(BeaconBodiesSyncFeed::new(
            self.tree.clone(),
            self.pivot.clone(),
            &self.config,
        ));
        bodies_feed.activate()?;
        let dispatcher = self.attach_metrics(SyncDispatcher::<BodiesSyncBatch>::new(
            BEACON_BODIES_FEED,
            bodies_feed,
            Arc::new(BeaconBodiesDownloader),
            self.peer_manager.clone(),
            Arc::new(BodiesAllocationStrategyFactory),
            &self.config,
        ));
        dispatcher.start(cancel.clone()).await;
        self.update_chain_metrics();
        if cancel.is_cancelled() {
            warn!("Beacon sync cancelled during body stage");
            return Ok(self.state());
        }

        self.transition(SyncState::Synced);
        Ok(self.state())
    }

    fn attach_metrics<T: Send + 'static>(&self, dispatcher: SyncDispatcher<T>) -> SyncDispatcher<T> {
        match &self.metrics {
            Some(metrics) => dispatcher.with_metrics(metrics.clone()),
            None => dispatcher,
        }
    }

    /// Publishes the chain pointers to the metrics registry.
    pub fn update_chain_metrics(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let pointers = self.tree.pointers();
        metrics.set_best_known_number(pointers.best_known_number);
        metrics.set_best_suggested_body(
            pointers.best_suggested_body.as_ref().map_or(0, Block::number),
        );
        metrics.set_head_number(pointers.head.as_ref().map_or(0, Block::number));
        metrics.set_best_known_beacon_number(pointers.best_known_beacon_number.unwrap_or_default());
        metrics.set_lowest_inserted_beacon_header(
            pointers
                .lowest_inserted_beacon_header
                .as_ref()
                .map_or(0, |header| header.number),
        );
    }

    fn update_peer_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_peers(self.peer_manager.peer_count());
        }
    }

    fn transition(&self, target: SyncState) {
        let mut state = self.state.lock();
        if *state == target {
            return;
        }
        if !state.can_transition_to(target) {
            warn!(from = ?*state, to = ?target, "Unexpected sync state transition");
        }
        info!(from = ?*state, to = ?target, "Sync state changed");
        *state = target;
    }
}
