mod beacon_feeds_tests;
mod chain_level_helper_tests;

use crate::peer::{PeerId, PeerInfo, SyncPeer};
use anyhow::{bail, Result};
use block_tree::{BlockTree, BlockTreeStores, ChainBuilder};
use chain::{ChainSpec, SyncConfig};
use containers::{Block, BlockBody, BlockHeader, BlockNumber, Hash256, LookupOptions, U256};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Mock peer for testing
#[derive(Default)]
pub(crate) struct MockPeer {
    pub failing: bool,
    pub requests: AtomicUsize,
}

impl MockPeer {
    pub fn failing() -> Self {
        Self {
            failing: true,
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl SyncPeer for MockPeer {
    async fn get_block_headers(
        &self,
        _start: BlockNumber,
        _count: usize,
        _skip: usize,
        _reverse: bool,
    ) -> Result<Vec<BlockHeader>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            bail!("peer disconnected");
        }
        Ok(Vec::new())
    }

    async fn get_block_bodies(&self, hashes: &[Hash256]) -> Result<Vec<Option<BlockBody>>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            bail!("peer disconnected");
        }
        Ok(vec![None; hashes.len()])
    }
}

pub(crate) fn mock_peer_info(peer: Arc<dyn SyncPeer>, head_number: BlockNumber) -> PeerInfo {
    PeerInfo {
        id: PeerId::random(),
        head_number,
        head_hash: Hash256::ZERO,
        total_difficulty: U256::from(head_number),
        peer,
    }
}

pub(crate) fn build_tree(length: usize) -> Arc<BlockTree> {
    build_tree_with_config(length, &SyncConfig::default())
}

pub(crate) fn build_tree_with_config(length: usize, config: &SyncConfig) -> Arc<BlockTree> {
    let tree = ChainBuilder::new()
        .build_tree(
            length,
            BlockTreeStores::in_memory(),
            Arc::new(ChainSpec::default()),
            config,
        )
        .expect("tree should build");
    Arc::new(tree)
}

pub(crate) fn block_at(tree: &BlockTree, number: BlockNumber) -> Block {
    tree.find_block_by_number(number, LookupOptions::empty())
        .expect("lookup should succeed")
        .unwrap_or_else(|| panic!("block {number} should exist"))
}

pub(crate) fn main_chain_hash(tree: &BlockTree, number: BlockNumber) -> Option<Hash256> {
    tree.find_level(number)
        .expect("level lookup should succeed")
        .and_then(|level| level.main_chain_block().map(|info| info.block_hash))
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold in time");
}

pub(crate) async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("future should complete in time")
}
