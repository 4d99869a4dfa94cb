use crate::states::SyncFeedState;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Single-slot wake-up latch of a dispatcher.
///
/// Every transition into `Dormant` installs a fresh token and releases the
/// previous one, under the same lock that records the state. A consumer
/// takes `(state, token)` together and waits on the token outside the lock,
/// so a transition between its decision to sleep and the wait itself is
/// never lost.
#[derive(Debug)]
pub struct WakeSignal {
    inner: Mutex<WakeState>,
}

#[derive(Debug)]
struct WakeState {
    state: SyncFeedState,
    dormant: Option<CancellationToken>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WakeState {
                state: SyncFeedState::Dormant,
                dormant: Some(CancellationToken::new()),
            }),
        }
    }

    pub fn state(&self) -> SyncFeedState {
        self.inner.lock().state
    }

    /// Current state with the token to wait on while it is `Dormant`.
    pub fn snapshot(&self) -> (SyncFeedState, Option<CancellationToken>) {
        let inner = self.inner.lock();
        (inner.state, inner.dormant.clone())
    }

    /// Records `state`, returning whether it changed.
    pub fn update(&self, state: SyncFeedState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return false;
        }

        inner.state = state;
        let next = (state == SyncFeedState::Dormant).then(CancellationToken::new);
        if let Some(previous) = std::mem::replace(&mut inner.dormant, next) {
            previous.cancel();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_releases_dormant_token() {
        let signal = WakeSignal::new();
        let (state, token) = signal.snapshot();
        assert_eq!(state, SyncFeedState::Dormant);
        let token = token.unwrap();
        assert!(!token.is_cancelled());

        assert!(signal.update(SyncFeedState::Active));
        assert!(token.is_cancelled());
        assert!(signal.snapshot().1.is_none());
    }

    #[test]
    fn test_each_dormant_transition_installs_new_token() {
        let signal = WakeSignal::new();
        signal.update(SyncFeedState::Active);
        signal.update(SyncFeedState::Dormant);

        let first = signal.snapshot().1.unwrap();
        assert!(!signal.update(SyncFeedState::Dormant));
        assert!(!first.is_cancelled());

        signal.update(SyncFeedState::Active);
        signal.update(SyncFeedState::Dormant);
        let second = signal.snapshot().1.unwrap();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }
}
