use crate::feed::AllocationContexts;
use crate::strategies::PeerAllocationStrategy;
use anyhow::Result;
use async_trait::async_trait;
use containers::{BlockBody, BlockHeader, BlockNumber, Hash256, U256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Wire protocol of a remote peer as used by sync feeds.
///
/// Abstracts the network layer to allow testing with mocks.
#[async_trait]
pub trait SyncPeer: Send + Sync {
    /// Request `count` headers starting at `start`, every `skip + 1`
    /// numbers, descending when `reverse` is set.
    async fn get_block_headers(
        &self,
        start: BlockNumber,
        count: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>>;

    /// Request bodies by block hash. Unknown hashes yield `None` in place.
    async fn get_block_bodies(&self, hashes: &[Hash256]) -> Result<Vec<Option<BlockBody>>>;
}

/// Chain status a peer advertised together with its connection.
#[derive(Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub head_number: BlockNumber,
    pub head_hash: Hash256,
    pub total_difficulty: U256,
    pub peer: Arc<dyn SyncPeer>,
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInfo")
            .field("id", &self.id)
            .field("head_number", &self.head_number)
            .field("head_hash", &self.head_hash)
            .field("total_difficulty", &self.total_difficulty)
            .finish_non_exhaustive()
    }
}

/// Result of a pool allocation. `current` is `None` when no peer could be
/// allocated before the timeout.
#[derive(Debug, Clone)]
pub struct SyncPeerAllocation {
    pub current: Option<PeerInfo>,
    pub contexts: AllocationContexts,
}

impl SyncPeerAllocation {
    pub fn empty(contexts: AllocationContexts) -> Self {
        Self {
            current: None,
            contexts,
        }
    }

    pub fn has_peer(&self) -> bool {
        self.current.is_some()
    }
}

/// Pool of connected peers that dispatchers borrow for single requests.
#[async_trait]
pub trait SyncPeerPool: Send + Sync {
    /// Waits up to `timeout` for a peer accepted by `strategy`.
    async fn allocate(
        &self,
        strategy: Box<dyn PeerAllocationStrategy>,
        contexts: AllocationContexts,
        timeout: Duration,
    ) -> SyncPeerAllocation;

    fn free(&self, allocation: &SyncPeerAllocation);

    fn report_weak_peer(&self, peer: &PeerInfo, contexts: AllocationContexts);

    fn report_no_sync_progress(&self, peer: &PeerInfo, contexts: AllocationContexts);
}
