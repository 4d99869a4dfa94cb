use crate::peer::{PeerId, PeerInfo};
use containers::BlockNumber;

/// A peer the pool could hand out right now.
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub info: PeerInfo,
    /// Number of times the peer was reported weak.
    pub weakness: u32,
}

pub trait PeerAllocationStrategy: Send + Sync {
    fn select(&self, candidates: &[PeerCandidate]) -> Option<PeerId>;
}

/// Picks the peer with the highest total difficulty, preferring the least
/// weak one among equals.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestPeerStrategy;

impl PeerAllocationStrategy for BestPeerStrategy {
    fn select(&self, candidates: &[PeerCandidate]) -> Option<PeerId> {
        candidates
            .iter()
            .max_by(|left, right| {
                left.info
                    .total_difficulty
                    .cmp(&right.info.total_difficulty)
                    .then(right.weakness.cmp(&left.weakness))
            })
            .map(|candidate| candidate.info.id)
    }
}

/// Restricts the best peer choice to peers whose head reaches `min_number`.
#[derive(Debug, Clone, Copy)]
pub struct BlocksAvailableStrategy {
    pub min_number: BlockNumber,
}

impl PeerAllocationStrategy for BlocksAvailableStrategy {
    fn select(&self, candidates: &[PeerCandidate]) -> Option<PeerId> {
        let eligible: Vec<PeerCandidate> = candidates
            .iter()
            .filter(|candidate| candidate.info.head_number >= self.min_number)
            .cloned()
            .collect();
        BestPeerStrategy.select(&eligible)
    }
}

/// Builds the allocation strategy for one request.
pub trait PeerAllocationStrategyFactory<T>: Send + Sync {
    fn create(&self, request: &T) -> Box<dyn PeerAllocationStrategy>;
}

impl<T> PeerAllocationStrategyFactory<T> for BestPeerStrategy {
    fn create(&self, _request: &T) -> Box<dyn PeerAllocationStrategy> {
        Box::new(BestPeerStrategy)
    }
}
