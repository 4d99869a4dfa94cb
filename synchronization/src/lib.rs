//! Beacon sync for the execution chain store.
//!
//! This crate downloads the part of the chain between the local head and a
//! pivot block supplied by the consensus layer. It includes:
//!
//! - **Sync Feeds**: State machines that produce requests and consume responses
//! - **Sync Dispatcher**: Drives one feed against the peer pool
//! - **Peer Manager**: Tracks peers and allocates them to requests
//! - **Chain Level Helper**: Plans body downloads over the beacon main chain
//! - **Sync Service**: Runs the header stage and then the body stage
//!
//! ## Feed State Machine
//!
//! - **DORMANT**: No work right now, the dispatcher waits for a wake-up
//! - **ACTIVE**: Requests are prepared and dispatched
//! - **FINISHED**: Terminal, the dispatcher exits

pub mod beacon_bodies_feed;
pub mod beacon_headers_feed;
pub mod beacon_pivot;
pub mod chain_level_helper;
pub mod config;
pub mod dispatcher;
pub mod feed;
pub mod peer;
pub mod peer_manager;
pub mod service;
pub mod states;
pub mod strategies;
pub mod tree_peer;
pub mod wake_signal;

pub use beacon_bodies_feed::{BeaconBodiesSyncFeed, BodiesSyncBatch};
pub use beacon_headers_feed::{BeaconHeadersSyncFeed, HeadersSyncBatch};
pub use beacon_pivot::BeaconPivot;
pub use chain_level_helper::{BlockDownloadContext, ChainLevelHelper};
pub use config::*;
pub use dispatcher::SyncDispatcher;
pub use feed::{
    AllocationContexts, FeedStateChannel, SyncDownloader, SyncFeed, SyncResponseHandlingResult,
};
pub use peer::{PeerId, PeerInfo, SyncPeer, SyncPeerAllocation, SyncPeerPool};
pub use peer_manager::{PeerManager, PooledPeer};
pub use service::SyncService;
pub use states::{SyncFeedState, SyncState};
pub use strategies::{
    BestPeerStrategy, BlocksAvailableStrategy, PeerAllocationStrategy,
    PeerAllocationStrategyFactory, PeerCandidate,
};
pub use tree_peer::TreeBackedSyncPeer;
pub use wake_signal::WakeSignal;

#[cfg(test)]
mod tests;
