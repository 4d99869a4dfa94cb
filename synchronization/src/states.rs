//! Feed and sync service state machines.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncFeedState {
    /// Dormant state: The feed has no work right now.
    ///
    /// Initial state of every feed. A dispatcher suspends on a dormant feed
    /// until the feed becomes active or finishes.
    #[default]
    Dormant,

    /// Active state: The feed can produce requests.
    Active,

    /// Finished state: The feed completed its work or was shut down.
    ///
    /// Terminal. A dispatcher that observes it exits its loop.
    Finished,
}

impl SyncFeedState {
    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: SyncFeedState) -> bool {
        match self {
            SyncFeedState::Dormant => matches!(target, SyncFeedState::Active | SyncFeedState::Finished),
            SyncFeedState::Active => matches!(target, SyncFeedState::Dormant | SyncFeedState::Finished),
            SyncFeedState::Finished => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFeedState::Dormant => "dormant",
            SyncFeedState::Active => "active",
            SyncFeedState::Finished => "finished",
        }
    }
}

/// Stage of a beacon sync run driven by `SyncService`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Idle state: No pivot has been supplied yet.
    #[default]
    Idle,

    /// Headers state: Downloading headers backwards from the pivot.
    Headers,

    /// Bodies state: Filling bodies forwards from the local chain to the pivot.
    Bodies,

    /// Synced state: The pivot has become part of the local main chain.
    Synced,
}

impl SyncState {
    /// Check if a transition to the target state is valid.
    ///
    /// A new pivot may restart the header stage from any stage.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        match self {
            SyncState::Idle => matches!(target, SyncState::Headers),
            SyncState::Headers => matches!(target, SyncState::Bodies | SyncState::Idle),
            SyncState::Bodies => {
                matches!(target, SyncState::Synced | SyncState::Headers | SyncState::Idle)
            }
            SyncState::Synced => matches!(target, SyncState::Headers | SyncState::Idle),
        }
    }
}
