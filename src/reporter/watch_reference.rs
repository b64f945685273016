use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Stops a running list-then-watch stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct WatchHandle {
    token: CancellationToken,
}

impl WatchHandle {
    pub(crate) fn stop(&self) {
        self.token.cancel();
    }

    pub(crate) async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Permission to run the watch of one target, granted by [`WatchReference::start`].
#[derive(Clone)]
pub(crate) struct Lease {
    pub(crate) token: CancellationToken,
    generation: u64,
}

/// Tracks the lifecycle of the watch for one target.
#[derive(Default)]
pub(crate) struct WatchReference {
    state: Mutex<RefState>,
}

#[derive(Default)]
struct RefState {
    started: bool,
    generation: u64,
    token: Option<CancellationToken>,
    /// Only set while started.
    handle: Option<WatchHandle>,
}

impl RefState {
    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
        self.started = false;
    }

    fn shutdown(&mut self) {
        self.release();
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

impl WatchReference {
    /// Marks the watch as started, returning a child token of `parent`.
    /// Returns `None` if it was already started.
    pub(crate) fn start(&self, parent: &CancellationToken) -> Option<Lease> {
        let mut state = self.state.lock();
        if state.started {
            return None;
        }
        let token = parent.child_token();
        state.started = true;
        state.generation += 1;
        state.token = Some(token.clone());
        Some(Lease {
            token,
            generation: state.generation,
        })
    }

    /// Attaches the live watch handle. Fails if `lease` is no longer current,
    /// in which case the handle is stopped right away.
    pub(crate) fn set_watch(&self, lease: &Lease, handle: WatchHandle) -> bool {
        let mut state = self.state.lock();
        if !state.started || state.generation != lease.generation {
            handle.stop();
            return false;
        }
        state.handle = Some(handle);
        true
    }

    pub(crate) fn has_started(&self) -> bool {
        self.state.lock().started
    }

    pub(crate) fn has_synced(&self) -> bool {
        let state = self.state.lock();
        state.started && state.handle.is_some()
    }

    /// Stops the watch and cancels its token.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        if state.started {
            state.shutdown();
        }
    }

    /// Like [`stop`](Self::stop), but only if `lease` is still current.
    pub(crate) fn stop_lease(&self, lease: &Lease) {
        let mut state = self.state.lock();
        if state.started && state.generation == lease.generation {
            state.shutdown();
        }
    }

    /// Gives up `lease` so that the watch can be started again with a new one.
    ///
    /// The lease's token is cancelled either way; the watch is only marked as
    /// not started if `lease` is still current.
    pub(crate) fn restart(&self, lease: &Lease) {
        let mut state = self.state.lock();
        if state.started && state.generation == lease.generation {
            state.release();
            state.token = None;
        }
        lease.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::{WatchHandle, WatchReference};

    #[test]
    fn start_is_idempotent() {
        let parent = CancellationToken::new();
        let reference = WatchReference::default();

        assert!(!reference.has_started());
        assert!(reference.start(&parent).is_some());
        assert!(reference.start(&parent).is_none());
        assert!(reference.has_started());
    }

    #[test]
    fn synced_once_handle_attached() {
        let parent = CancellationToken::new();
        let reference = WatchReference::default();
        assert!(!reference.has_synced());

        let lease = reference.start(&parent).unwrap();
        assert!(!reference.has_synced());

        assert!(reference.set_watch(&lease, WatchHandle::default()));
        assert!(reference.has_synced());
    }

    #[test]
    fn stop_cancels_lease_and_handle() {
        let parent = CancellationToken::new();
        let reference = WatchReference::default();
        let lease = reference.start(&parent).unwrap();
        let handle = WatchHandle::default();
        reference.set_watch(&lease, handle.clone());

        reference.stop();
        assert!(lease.token.is_cancelled());
        assert!(handle.token.is_cancelled());
        assert!(!reference.has_started());
        assert!(!reference.has_synced());

        // Stopping twice is harmless.
        reference.stop();
    }

    #[test]
    fn restart_releases_watch_and_cancels_lease() {
        let parent = CancellationToken::new();
        let reference = WatchReference::default();
        let lease = reference.start(&parent).unwrap();

        reference.restart(&lease);
        assert!(!reference.has_started());
        assert!(lease.token.is_cancelled());
        assert!(!parent.is_cancelled());

        // A stale lease cannot attach a handle.
        let handle = WatchHandle::default();
        assert!(!reference.set_watch(&lease, handle.clone()));
        assert!(handle.token.is_cancelled());
        assert!(reference.start(&parent).is_some());
    }

    #[test]
    fn stale_lease_does_not_stop_newer_watch() {
        let parent = CancellationToken::new();
        let reference = WatchReference::default();
        let old = reference.start(&parent).unwrap();
        reference.restart(&old);
        let new = reference.start(&parent).unwrap();

        reference.stop_lease(&old);
        reference.restart(&old);
        assert!(reference.has_started());
        assert!(!new.token.is_cancelled());

        reference.stop_lease(&new);
        assert!(!reference.has_started());
        assert!(new.token.is_cancelled());
    }

    #[test]
    fn parent_cancellation_cascades() {
        let parent = CancellationToken::new();
        let reference = WatchReference::default();
        let lease = reference.start(&parent).unwrap();
        parent.cancel();
        assert!(lease.token.is_cancelled());
    }
}
