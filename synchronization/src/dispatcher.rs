use crate::feed::{AllocationContexts, SyncDownloader, SyncFeed, SyncResponseHandlingResult};
use crate::peer::{PeerInfo, SyncPeerAllocation, SyncPeerPool};
use crate::states::SyncFeedState;
use crate::strategies::PeerAllocationStrategyFactory;
use crate::wake_signal::WakeSignal;
use chain::SyncConfig;
use metrics::SharedMetrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Returns the allocation to the pool when dropped.
struct AllocationGuard {
    pool: Arc<dyn SyncPeerPool>,
    allocation: SyncPeerAllocation,
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.pool.free(&self.allocation);
    }
}

/// Drives one feed: prepares requests, borrows peers and hands responses
/// back to the feed.
pub struct SyncDispatcher<T: Send + 'static> {
    name: &'static str,
    feed: Arc<dyn SyncFeed<T>>,
    downloader: Arc<dyn SyncDownloader<T>>,
    pool: Arc<dyn SyncPeerPool>,
    strategy_factory: Arc<dyn PeerAllocationStrategyFactory<T>>,
    allocation_timeout: Duration,
    empty_request_backoff: Duration,
    metrics: Option<SharedMetrics>,
    wake: Arc<WakeSignal>,
}

impl<T: Send + 'static> SyncDispatcher<T> {
    pub fn new(
        name: &'static str,
        feed: Arc<dyn SyncFeed<T>>,
        downloader: Arc<dyn SyncDownloader<T>>,
        pool: Arc<dyn SyncPeerPool>,
        strategy_factory: Arc<dyn PeerAllocationStrategyFactory<T>>,
        config: &SyncConfig,
    ) -> Self {
        let wake = feed.state_channel().wake_signal();
        Self {
            name,
            feed,
            downloader,
            pool,
            strategy_factory,
            allocation_timeout: Duration::from_millis(config.allocation_timeout_ms),
            empty_request_backoff: Duration::from_millis(config.empty_request_backoff_ms),
            metrics: None,
            wake,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs until the feed finishes or `cancel` fires. Cancellation finishes
    /// the feed and is not an error.
    pub async fn start(&self, cancel: CancellationToken) {
        info!(feed = self.name, "Sync dispatcher started");
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.try_join_next().is_some() {}

            let (state, dormant) = self.wake.snapshot();
            match state {
                SyncFeedState::Finished => {
                    info!(feed = self.name, "Sync feed finished");
                    break;
                }
                SyncFeedState::Dormant => {
                    let Some(dormant) = dormant else {
                        continue;
                    };
                    debug!(feed = self.name, "Sync feed is dormant");
                    tokio::select! {
                        _ = dormant.cancelled() => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
                SyncFeedState::Active => {}
            }

            let request = tokio::select! {
                request = self.feed.prepare_request() => request,
                _ = cancel.cancelled() => break,
            };
            let request = match request {
                Some(request) => request,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.empty_request_backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            let contexts = self.feed.contexts();
            let strategy = self.strategy_factory.create(&request);
            let allocation = tokio::select! {
                allocation = self.pool.allocate(strategy, contexts, self.allocation_timeout) => allocation,
                _ = cancel.cancelled() => break,
            };

            let Some(peer) = allocation.current.clone() else {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_peer_allocation_failure(self.name);
                }
                let result = self.feed.handle_response(request, None).await;
                react(self.name, self.pool.as_ref(), self.metrics.as_ref(), None, contexts, result);
                continue;
            };

            let guard = AllocationGuard {
                pool: self.pool.clone(),
                allocation,
            };
            let task = self.dispatch(peer, request, contexts, guard);
            if self.feed.is_multi_feed() {
                in_flight.spawn(task);
            } else {
                tokio::select! {
                    _ = task => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }

        in_flight.shutdown().await;
        if cancel.is_cancelled() {
            info!(feed = self.name, "Sync dispatcher cancelled");
        }
        self.feed.finish();
    }

    fn dispatch(
        &self,
        peer: PeerInfo,
        mut request: T,
        contexts: AllocationContexts,
        guard: AllocationGuard,
    ) -> impl Future<Output = ()> + Send + 'static {
        let name = self.name;
        let feed = self.feed.clone();
        let downloader = self.downloader.clone();
        let pool = self.pool.clone();
        let metrics = self.metrics.clone();

        async move {
            if let Err(error) = downloader.dispatch(&peer, &mut request).await {
                warn!(feed = name, peer = %peer.id, error = %error, "Sync request failed");
                if let Some(metrics) = &metrics {
                    metrics.inc_dispatch_failure(name);
                }
            }
            let result = feed.handle_response(request, Some(&peer)).await;
            react(name, pool.as_ref(), metrics.as_ref(), Some(&peer), contexts, result);
            drop(guard);
        }
    }
}

fn react(
    name: &'static str,
    pool: &dyn SyncPeerPool,
    metrics: Option<&SharedMetrics>,
    peer: Option<&PeerInfo>,
    contexts: AllocationContexts,
    result: SyncResponseHandlingResult,
) {
    if let Some(metrics) = metrics {
        metrics.inc_sync_response(name, result.as_str());
    }

    match (result, peer) {
        (SyncResponseHandlingResult::LesserQuality, Some(peer)) => {
            pool.report_weak_peer(peer, contexts);
        }
        (SyncResponseHandlingResult::NoProgress, Some(peer)) => {
            pool.report_no_sync_progress(peer, contexts);
        }
        (SyncResponseHandlingResult::InternalError, _) => {
            error!(feed = name, peer = ?peer.map(|peer| peer.id), "Sync response handling failed");
        }
        _ => {}
    }
}
