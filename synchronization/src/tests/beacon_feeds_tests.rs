use crate::beacon_bodies_feed::{BeaconBodiesDownloader, BeaconBodiesSyncFeed};
use crate::beacon_headers_feed::{BeaconHeadersSyncFeed, HeadersSyncBatch};
use crate::beacon_pivot::BeaconPivot;
use crate::feed::{SyncDownloader, SyncFeed, SyncResponseHandlingResult};
use crate::peer::{PeerId, PeerInfo};
use crate::states::SyncFeedState;
use crate::tests::{block_at, build_tree, main_chain_hash, mock_peer_info, MockPeer};
use crate::tree_peer::TreeBackedSyncPeer;
use block_tree::{BlockTree, ChainBuilder};
use chain::SyncConfig;
use containers::{BlockHeader, BlockNumber, InsertBlockOptions, InsertHeaderOptions};
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct BeaconSetup {
    local: Arc<BlockTree>,
    remote: Arc<BlockTree>,
    pivot: Arc<BeaconPivot>,
    config: SyncConfig,
}

impl BeaconSetup {
    /// Local chain of `local_length` blocks, remote of `remote_length`,
    /// with the remote block `pivot` inserted locally as beacon pivot.
    fn new(local_length: usize, remote_length: usize, pivot: BlockNumber) -> Self {
        let local = build_tree(local_length);
        let remote = build_tree(remote_length);
        let pivot_block = block_at(&remote, pivot);
        local
            .insert_block(
                &pivot_block,
                InsertBlockOptions::SAVE_HEADER,
                InsertHeaderOptions::BEACON_BLOCK_INSERT
                    | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
            )
            .unwrap();
        let pivot = Arc::new(BeaconPivot::new(local.clone()).unwrap());
        pivot.ensure_pivot(&pivot_block.header, true).unwrap();

        let config = SyncConfig {
            max_headers_per_request: 2,
            max_bodies_per_request: 3,
            ..SyncConfig::default()
        };
        Self {
            local,
            remote,
            pivot,
            config,
        }
    }

    fn headers_feed(&self) -> BeaconHeadersSyncFeed {
        BeaconHeadersSyncFeed::new(self.local.clone(), self.pivot.clone(), &self.config)
    }

    fn bodies_feed(&self) -> BeaconBodiesSyncFeed {
        BeaconBodiesSyncFeed::new(self.local.clone(), self.pivot.clone(), &self.config)
    }

    /// Remote headers as a peer would send them, descending from `start`.
    fn remote_headers(&self, start: BlockNumber, count: usize) -> Vec<BlockHeader> {
        (0..count as u64)
            .map(|offset| {
                block_at(&self.remote, start - offset)
                    .header
                    .with_total_difficulty(None)
            })
            .collect()
    }

    fn respond(&self, mut batch: HeadersSyncBatch) -> HeadersSyncBatch {
        batch.response = Some(self.remote_headers(batch.start_number, batch.count));
        batch
    }

    fn insert_beacon_blocks(&self, low: BlockNumber, high: BlockNumber) {
        for number in (low..=high).rev() {
            self.local
                .insert_block(
                    &block_at(&self.remote, number),
                    InsertBlockOptions::SAVE_HEADER,
                    InsertHeaderOptions::BEACON_BLOCK_INSERT
                        | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
                )
                .unwrap();
        }
    }

    fn insert_beacon_headers(&self, low: BlockNumber, high: BlockNumber) {
        for number in (low..=high).rev() {
            let header = block_at(&self.remote, number).header.with_total_difficulty(None);
            self.local
                .insert_header(&header, InsertHeaderOptions::BEACON_HEADER_INSERT)
                .unwrap();
        }
    }

    /// Beacon headers of a fork off the remote chain covering `low..=high`.
    fn insert_stale_fork(&self, low: BlockNumber, high: BlockNumber) -> Vec<BlockHeader> {
        let fork = ChainBuilder::new()
            .with_nonce(7)
            .extend(&block_at(&self.remote, low - 1), (high - low + 1) as usize);
        let headers: Vec<_> = fork
            .into_iter()
            .map(|block| block.header.with_total_difficulty(None))
            .collect();
        for header in headers.iter().rev() {
            self.local
                .insert_header(
                    header,
                    InsertHeaderOptions::BEACON_HEADER_INSERT
                        | InsertHeaderOptions::MOVE_TO_BEACON_MAIN_CHAIN,
                )
                .unwrap();
        }
        headers
    }
}

fn test_peer() -> PeerInfo {
    mock_peer_info(Arc::new(MockPeer::default()), 10)
}

#[tokio::test]
async fn test_headers_feed_links_out_of_order_batches() {
    let setup = BeaconSetup::new(4, 10, 9);
    let feed = setup.headers_feed();
    feed.activate().unwrap();
    assert_eq!(feed.current_state(), SyncFeedState::Active);

    let top = feed.prepare_request().await.unwrap();
    let middle = feed.prepare_request().await.unwrap();
    let bottom = feed.prepare_request().await.unwrap();
    assert_eq!((top.start_number, top.count), (8, 2));
    assert_eq!((middle.start_number, middle.count), (6, 2));
    assert_eq!((bottom.start_number, bottom.count), (4, 1));
    assert_eq!(feed.prepare_request().await, None);

    let peer = test_peer();
    assert_eq!(
        feed.handle_response(setup.respond(middle), Some(&peer)).await,
        SyncResponseHandlingResult::Ok
    );
    assert_eq!(
        setup.local.lowest_inserted_beacon_header().map(|header| header.number),
        Some(9)
    );

    assert_eq!(
        feed.handle_response(setup.respond(top), Some(&peer)).await,
        SyncResponseHandlingResult::Ok
    );
    assert_eq!(
        setup.local.lowest_inserted_beacon_header().map(|header| header.number),
        Some(5)
    );
    assert_eq!(feed.current_state(), SyncFeedState::Active);

    assert_eq!(
        feed.handle_response(setup.respond(bottom), Some(&peer)).await,
        SyncResponseHandlingResult::Ok
    );
    assert_eq!(feed.current_state(), SyncFeedState::Finished);
    assert_eq!(
        setup.local.lowest_inserted_beacon_header().map(|header| header.number),
        Some(4)
    );
    // Header sync never moves the classical pointers.
    assert_eq!(setup.local.best_known_number(), 3);
}

#[tokio::test]
async fn test_headers_feed_ignores_lowest_header_of_another_fork() {
    let setup = BeaconSetup::new(4, 10, 9);
    let stale = setup.insert_stale_fork(5, 8);
    assert_eq!(
        setup.local.lowest_inserted_beacon_header().map(|header| header.hash()),
        Some(stale[0].hash())
    );

    let feed = setup.headers_feed();
    feed.activate().unwrap();
    let top = feed.prepare_request().await.unwrap();
    assert_eq!((top.start_number, top.count), (8, 2));

    assert_eq!(
        feed.handle_response(setup.respond(top), Some(&test_peer())).await,
        SyncResponseHandlingResult::Ok
    );
    for number in 7..=8 {
        let level = setup.local.find_level(number).unwrap().unwrap();
        assert_eq!(
            level.beacon_main_chain_block().map(|info| info.block_hash),
            Some(block_at(&setup.remote, number).hash()),
            "level {number}"
        );
    }
}

#[tokio::test]
async fn test_headers_feed_resumes_from_own_ancestor() {
    let setup = BeaconSetup::new(4, 10, 9);
    setup.insert_beacon_headers(6, 8);

    let feed = setup.headers_feed();
    feed.activate().unwrap();
    let next = feed.prepare_request().await.unwrap();
    assert_eq!((next.start_number, next.count), (5, 2));
}

#[tokio::test]
async fn test_headers_feed_requeues_failed_batches() {
    let setup = BeaconSetup::new(4, 10, 9);
    let feed = setup.headers_feed();
    feed.activate().unwrap();
    let peer = test_peer();

    let batch = feed.prepare_request().await.unwrap();
    assert_eq!(
        feed.handle_response(batch.clone(), None).await,
        SyncResponseHandlingResult::NotAssigned
    );
    let retried = feed.prepare_request().await.unwrap();
    assert_eq!(retried, batch);

    let mut empty = retried;
    empty.response = Some(Vec::new());
    assert_eq!(
        feed.handle_response(empty, Some(&peer)).await,
        SyncResponseHandlingResult::NoProgress
    );

    let mut unlinked = feed.prepare_request().await.unwrap();
    assert_eq!(unlinked.start_number, batch.start_number);
    let mut headers = setup.remote_headers(unlinked.start_number, unlinked.count);
    headers.reverse();
    unlinked.response = Some(headers);
    assert_eq!(
        feed.handle_response(unlinked, Some(&peer)).await,
        SyncResponseHandlingResult::LesserQuality
    );

    let again = feed.prepare_request().await.unwrap();
    assert_eq!(again.start_number, batch.start_number);
    assert_eq!(feed.current_state(), SyncFeedState::Active);
}

#[tokio::test]
async fn test_headers_feed_requeues_remainder_of_short_response() {
    let setup = BeaconSetup::new(4, 10, 9);
    let feed = setup.headers_feed();
    feed.activate().unwrap();

    let mut batch = feed.prepare_request().await.unwrap();
    batch.response = Some(setup.remote_headers(8, 1));
    assert_eq!(
        feed.handle_response(batch, Some(&test_peer())).await,
        SyncResponseHandlingResult::Emptish
    );

    let remainder = feed.prepare_request().await.unwrap();
    assert_eq!((remainder.start_number, remainder.count), (7, 1));
}

#[tokio::test]
async fn test_headers_feed_finishes_when_pivot_already_linked() {
    let setup = BeaconSetup::new(4, 10, 4);
    let feed = setup.headers_feed();
    feed.activate().unwrap();

    assert_eq!(feed.current_state(), SyncFeedState::Finished);
    assert_eq!(feed.prepare_request().await, None);
}

#[tokio::test]
async fn test_headers_feed_stays_dormant_without_pivot() {
    let local = build_tree(4);
    let pivot = Arc::new(BeaconPivot::new(local.clone()).unwrap());
    let feed = BeaconHeadersSyncFeed::new(local, pivot, &SyncConfig::default());
    feed.activate().unwrap();

    assert_eq!(feed.current_state(), SyncFeedState::Dormant);
}

#[tokio::test]
async fn test_bodies_feed_fills_from_local_beacon_blocks() {
    let setup = BeaconSetup::new(4, 10, 9);
    setup.insert_beacon_blocks(4, 8);
    let feed = setup.bodies_feed();
    feed.activate().unwrap();
    assert_eq!(feed.current_state(), SyncFeedState::Active);

    let mut rounds = 0;
    while feed.current_state() == SyncFeedState::Active {
        let batch = feed.prepare_request().await.unwrap();
        assert!(batch.context.is_complete());
        assert_eq!(
            feed.handle_response(batch, None).await,
            SyncResponseHandlingResult::Ok
        );
        rounds += 1;
        assert!(rounds <= 2, "body sync should take two batches");
    }

    assert_eq!(feed.current_state(), SyncFeedState::Finished);
    assert_eq!(setup.local.head().map(|head| head.number()), Some(9));
    assert_eq!(setup.local.beacon_pivot().unwrap(), None);
    assert!(!setup.pivot.beacon_pivot_exists());
    for number in 0..=9 {
        assert_eq!(
            main_chain_hash(&setup.local, number),
            main_chain_hash(&setup.remote, number),
            "level {number}"
        );
    }
}

#[tokio::test]
async fn test_bodies_feed_downloads_missing_bodies() {
    let setup = BeaconSetup::new(4, 10, 6);
    setup.insert_beacon_headers(4, 5);
    let feed = setup.bodies_feed();
    feed.activate().unwrap();

    let mut batch = feed.prepare_request().await.unwrap();
    let numbers: Vec<_> = batch.context.headers().iter().map(|header| header.number).collect();
    assert_eq!(numbers, vec![4, 5, 6]);
    assert!(!batch.context.is_complete());

    let remote_peer = Arc::new(TreeBackedSyncPeer::new(setup.remote.clone()));
    let peer = remote_peer.peer_info(PeerId(1));
    BeaconBodiesDownloader.dispatch(&peer, &mut batch).await.unwrap();
    assert!(batch.context.is_complete());

    assert_eq!(
        feed.handle_response(batch, Some(&peer)).await,
        SyncResponseHandlingResult::Ok
    );
    assert_eq!(feed.current_state(), SyncFeedState::Finished);
    assert_eq!(setup.local.head().map(|head| head.number()), Some(6));
    assert_eq!(setup.local.best_known_number(), 6);
}

#[tokio::test]
async fn test_bodies_feed_reports_missing_bodies() {
    let setup = BeaconSetup::new(4, 10, 6);
    setup.insert_beacon_headers(4, 5);
    let feed = setup.bodies_feed();
    feed.activate().unwrap();

    let mut batch = feed.prepare_request().await.unwrap();
    let peer = test_peer();
    BeaconBodiesDownloader.dispatch(&peer, &mut batch).await.unwrap();

    assert_eq!(
        feed.handle_response(batch.clone(), Some(&peer)).await,
        SyncResponseHandlingResult::NoProgress
    );
    assert_eq!(
        feed.handle_response(batch, None).await,
        SyncResponseHandlingResult::NotAssigned
    );
    assert_eq!(feed.current_state(), SyncFeedState::Active);
    assert_eq!(setup.local.best_known_number(), 3);
}

#[tokio::test]
async fn test_bodies_feed_finishes_without_pivot() {
    let local = build_tree(4);
    let pivot = Arc::new(BeaconPivot::new(local.clone()).unwrap());
    let feed = BeaconBodiesSyncFeed::new(local, pivot, &SyncConfig::default());
    feed.activate().unwrap();

    assert_eq!(feed.current_state(), SyncFeedState::Finished);
}
