//! Peer manager for sync operations.
//!
//! Tracks the connected peers, selects peers for requests through an
//! allocation strategy and enforces per-peer request limits.

use crate::config::{NO_PROGRESS_SLEEP_MS, WEAK_PEER_THRESHOLD};
use crate::feed::AllocationContexts;
use crate::peer::{PeerId, PeerInfo, SyncPeerAllocation, SyncPeerPool};
use crate::strategies::{PeerAllocationStrategy, PeerCandidate};
use async_trait::async_trait;
use containers::{BlockNumber, Hash256, U256};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sync-specific state of a pooled peer.
#[derive(Debug, Clone)]
pub struct PooledPeer {
    pub info: PeerInfo,
    pub requests_in_flight: usize,
    pub weakness: u32,
    /// Contexts the peer is skipped for, each until its deadline.
    sleeping: Vec<(AllocationContexts, Instant)>,
}

impl PooledPeer {
    pub fn new(info: PeerInfo) -> Self {
        Self {
            info,
            requests_in_flight: 0,
            weakness: 0,
            sleeping: Vec::new(),
        }
    }

    pub fn is_weak(&self) -> bool {
        self.weakness >= WEAK_PEER_THRESHOLD
    }

    pub fn is_sleeping(&self, contexts: AllocationContexts, now: Instant) -> bool {
        self.sleeping
            .iter()
            .any(|(asleep, until)| asleep.intersects(contexts) && *until > now)
    }

    /// Check if peer is available for a new request.
    ///
    /// A peer is available if:
    /// - Below the concurrent request limit
    /// - Not reported weak too often
    /// - Not sleeping for any of the requested contexts
    pub fn is_available(
        &self,
        contexts: AllocationContexts,
        max_concurrent_requests: usize,
        now: Instant,
    ) -> bool {
        self.requests_in_flight < max_concurrent_requests
            && !self.is_weak()
            && !self.is_sleeping(contexts, now)
    }

    /// Mark that a request has been sent to this peer.
    pub fn on_request_start(&mut self) {
        self.requests_in_flight += 1;
    }

    /// Mark that a request has completed.
    pub fn on_request_complete(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
    }

    fn fall_asleep(&mut self, contexts: AllocationContexts, until: Instant) {
        let now = Instant::now();
        self.sleeping.retain(|(_, deadline)| *deadline > now);
        self.sleeping.push((contexts, until));
    }
}

/// In-memory peer pool.
pub struct PeerManager {
    peers: Mutex<HashMap<PeerId, PooledPeer>>,
    freed: Notify,
    max_concurrent_requests: usize,
    no_progress_sleep: Duration,
}

impl PeerManager {
    pub fn new(max_concurrent_requests: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            freed: Notify::new(),
            max_concurrent_requests: max_concurrent_requests.max(1),
            no_progress_sleep: Duration::from_millis(NO_PROGRESS_SLEEP_MS),
        }
    }

    pub fn with_no_progress_sleep(mut self, sleep: Duration) -> Self {
        self.no_progress_sleep = sleep;
        self
    }

    /// Add a peer, replacing the advertised status of a known one.
    pub fn add_peer(&self, info: PeerInfo) {
        let id = info.id;
        {
            let mut peers = self.peers.lock();
            match peers.get_mut(&id) {
                Some(pooled) => pooled.info = info,
                None => {
                    peers.insert(id, PooledPeer::new(info));
                }
            }
        }
        self.freed.notify_waiters();
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.lock().remove(peer_id).map(|pooled| pooled.info)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<PooledPeer> {
        self.peers.lock().get(peer_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Update the chain status a peer advertised.
    pub fn update_head(
        &self,
        peer_id: &PeerId,
        head_number: BlockNumber,
        head_hash: Hash256,
        total_difficulty: U256,
    ) {
        if let Some(pooled) = self.peers.lock().get_mut(peer_id) {
            pooled.info.head_number = head_number;
            pooled.info.head_hash = head_hash;
            pooled.info.total_difficulty = total_difficulty;
        }
        self.freed.notify_waiters();
    }

    /// Select an available peer through `strategy` and count the request.
    pub fn try_allocate(
        &self,
        strategy: &dyn PeerAllocationStrategy,
        contexts: AllocationContexts,
    ) -> Option<PeerInfo> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let candidates: Vec<PeerCandidate> = peers
            .values()
            .filter(|pooled| pooled.is_available(contexts, self.max_concurrent_requests, now))
            .map(|pooled| PeerCandidate {
                info: pooled.info.clone(),
                weakness: pooled.weakness,
            })
            .collect();

        let id = strategy.select(&candidates)?;
        let pooled = peers.get_mut(&id)?;
        pooled.on_request_start();
        Some(pooled.info.clone())
    }
}

#[async_trait]
impl SyncPeerPool for PeerManager {
    async fn allocate(
        &self,
        strategy: Box<dyn PeerAllocationStrategy>,
        contexts: AllocationContexts,
        timeout: Duration,
    ) -> SyncPeerAllocation {
        let deadline = Instant::now() + timeout;
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            // Register before checking so a free in between is not missed.
            freed.as_mut().enable();

            if let Some(info) = self.try_allocate(strategy.as_ref(), contexts) {
                return SyncPeerAllocation {
                    current: Some(info),
                    contexts,
                };
            }

            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                debug!(contexts = ?contexts, "Peer allocation timed out");
                return SyncPeerAllocation::empty(contexts);
            }
        }
    }

    fn free(&self, allocation: &SyncPeerAllocation) {
        let Some(info) = &allocation.current else {
            return;
        };
        if let Some(pooled) = self.peers.lock().get_mut(&info.id) {
            pooled.on_request_complete();
        }
        self.freed.notify_waiters();
    }

    fn report_weak_peer(&self, peer: &PeerInfo, contexts: AllocationContexts) {
        let mut peers = self.peers.lock();
        let Some(pooled) = peers.get_mut(&peer.id) else {
            return;
        };
        pooled.weakness += 1;
        if pooled.is_weak() {
            warn!(peer = %peer.id, weakness = pooled.weakness, "Peer is no longer allocated");
        } else {
            info!(peer = %peer.id, weakness = pooled.weakness, contexts = ?contexts, "Peer reported weak");
        }
    }

    fn report_no_sync_progress(&self, peer: &PeerInfo, contexts: AllocationContexts) {
        if let Some(pooled) = self.peers.lock().get_mut(&peer.id) {
            pooled.fall_asleep(contexts, Instant::now() + self.no_progress_sleep);
            debug!(peer = %peer.id, contexts = ?contexts, "Peer made no sync progress");
        }
    }
}
