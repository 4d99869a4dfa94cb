use crate::peer::PeerInfo;
use crate::states::SyncFeedState;
use crate::wake_signal::WakeSignal;
use anyhow::Result;
use async_trait::async_trait;
use containers::flags;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Classification of a handled response, used to judge the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncResponseHandlingResult {
    Ok,
    /// Fewer items than asked for.
    Emptish,
    Ignored,
    /// The peer sent data that does not fit the chain.
    LesserQuality,
    /// The peer sent nothing usable for this request.
    NoProgress,
    /// No peer was allocated for the request.
    NotAssigned,
    InternalError,
}

impl SyncResponseHandlingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Emptish => "emptish",
            Self::Ignored => "ignored",
            Self::LesserQuality => "lesser_quality",
            Self::NoProgress => "no_progress",
            Self::NotAssigned => "not_assigned",
            Self::InternalError => "internal_error",
        }
    }
}

flags! {
    /// Kinds of work a peer is allocated for.
    pub struct AllocationContexts: u8 {
        const HEADERS = 1;
        const BODIES = 2;

        const ALL = Self::HEADERS.bits() | Self::BODIES.bits();
    }
}

/// State holder embedded by every feed.
///
/// Each accepted transition is published to watchers and to the wake signal
/// of the dispatcher inside the same critical section, so both always agree
/// on the order of transitions.
#[derive(Debug)]
pub struct FeedStateChannel {
    name: &'static str,
    sender: watch::Sender<SyncFeedState>,
    wake: Arc<WakeSignal>,
}

impl FeedStateChannel {
    pub fn new(name: &'static str) -> Self {
        let (sender, _) = watch::channel(SyncFeedState::Dormant);
        Self {
            name,
            sender,
            wake: Arc::new(WakeSignal::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn current(&self) -> SyncFeedState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncFeedState> {
        self.sender.subscribe()
    }

    pub fn wake_signal(&self) -> Arc<WakeSignal> {
        self.wake.clone()
    }

    pub fn activate(&self) -> bool {
        self.transition(SyncFeedState::Active)
    }

    pub fn fall_asleep(&self) -> bool {
        self.transition(SyncFeedState::Dormant)
    }

    pub fn finish(&self) -> bool {
        self.transition(SyncFeedState::Finished)
    }

    /// Resolves once the feed reached `Finished`.
    pub async fn finished(&self) {
        let mut states = self.subscribe();
        let _ = states.wait_for(|state| *state == SyncFeedState::Finished).await;
    }

    fn transition(&self, target: SyncFeedState) -> bool {
        let changed = self.sender.send_if_modified(|state| {
            if !state.can_transition_to(target) {
                return false;
            }
            *state = target;
            self.wake.update(target);
            true
        });
        if changed {
            debug!(feed = self.name, state = target.as_str(), "Feed state changed");
        }
        changed
    }
}

/// Source of sync requests of type `T` and sink of their responses.
#[async_trait]
pub trait SyncFeed<T: Send + 'static>: Send + Sync {
    fn state_channel(&self) -> &FeedStateChannel;

    fn contexts(&self) -> AllocationContexts;

    /// Multi-feeds get several requests in flight at once; single feeds
    /// have each response handled before the next request is prepared.
    fn is_multi_feed(&self) -> bool;

    /// Next request, or `None` when there is no work right now.
    async fn prepare_request(&self) -> Option<T>;

    /// Consumes a dispatched request. `peer` is `None` when no peer could
    /// be allocated and the request was never sent.
    async fn handle_response(&self, request: T, peer: Option<&PeerInfo>)
        -> SyncResponseHandlingResult;

    fn finish(&self) {
        self.state_channel().finish();
    }

    fn current_state(&self) -> SyncFeedState {
        self.state_channel().current()
    }
}

/// Sends a prepared request to a peer and stores the response in it.
#[async_trait]
pub trait SyncDownloader<T: Send + 'static>: Send + Sync {
    async fn dispatch(&self, peer: &PeerInfo, request: &mut T) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_is_terminal() {
        let channel = FeedStateChannel::new("test");
        assert_eq!(channel.current(), SyncFeedState::Dormant);

        assert!(channel.activate());
        assert!(!channel.activate());
        assert!(channel.finish());
        assert!(!channel.activate());
        assert!(!channel.fall_asleep());
        assert_eq!(channel.current(), SyncFeedState::Finished);
        assert_eq!(channel.wake_signal().state(), SyncFeedState::Finished);
    }

    #[tokio::test]
    async fn test_watchers_observe_finish() {
        let channel = Arc::new(FeedStateChannel::new("test"));
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.finished().await })
        };

        channel.activate();
        channel.finish();
        waiter.await.unwrap();
    }
}
