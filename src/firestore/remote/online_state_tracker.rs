use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::firestore::error::FirestoreError;
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Connecting, or not trying to connect. Snapshots are held back from
    /// claiming to be offline until the state settles.
    Unknown,
    Online,
    /// Results from cache are reported as such.
    Offline,
}

/// How long the watch stream may take to produce its first message before
/// the client is reported as offline.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Watch stream failures tolerated before the client is reported as
/// offline.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    should_warn_offline: bool,
}

/// Derives the [`OnlineState`] from watch stream health.
///
/// The state only changes through the watch stream: a connection attempt
/// moves it to `Unknown` and starts a timeout, a message moves it to
/// `Online`, and repeated failures or the timeout move it to `Offline`.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    state: StdMutex<TrackerState>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                handler,
                state: StdMutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    timer: None,
                    should_warn_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.inner.state.lock().unwrap().state
    }

    /// Called whenever the watch stream is (re)started.
    pub fn handle_watch_stream_start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.watch_stream_failures != 0 {
            return;
        }
        let changed = set_state(&mut state, OnlineState::Unknown);
        if state.timer.is_none() {
            let weak = Arc::downgrade(&self.inner);
            state.timer = Some(self.inner.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                ONLINE_STATE_TIMEOUT,
                move || async move {
                    if let Some(inner) = weak.upgrade() {
                        OnlineStateTracker { inner }.handle_timeout();
                    }
                },
            ));
        }
        drop(state);
        self.broadcast(changed);
    }

    /// Called when the watch stream closed with `error`.
    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let mut state = self.inner.state.lock().unwrap();
        let changed = if state.state == OnlineState::Online {
            // Give the next connection attempt a chance before reporting
            // offline.
            set_state(&mut state, OnlineState::Unknown)
        } else {
            state.watch_stream_failures += 1;
            if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                clear_timer(&mut state);
                log_offline(
                    &mut state,
                    &format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"),
                );
                set_state(&mut state, OnlineState::Offline)
            } else {
                None
            }
        };
        drop(state);
        self.broadcast(changed);
    }

    /// Explicitly sets the state, e.g. `Online` once watch delivered a
    /// message or `Offline` when the network was disabled.
    pub fn set(&self, new_state: OnlineState) {
        let mut state = self.inner.state.lock().unwrap();
        clear_timer(&mut state);
        state.watch_stream_failures = 0;
        if new_state == OnlineState::Online {
            state.should_warn_offline = false;
        }
        let changed = set_state(&mut state, new_state);
        drop(state);
        self.broadcast(changed);
    }

    fn handle_timeout(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.timer = None;
        if state.state != OnlineState::Unknown {
            return;
        }
        log_offline(
            &mut state,
            &format!(
                "Backend didn't respond within {} seconds.",
                ONLINE_STATE_TIMEOUT.as_secs()
            ),
        );
        let changed = set_state(&mut state, OnlineState::Offline);
        drop(state);
        self.broadcast(changed);
    }

    fn broadcast(&self, changed: Option<OnlineState>) {
        if let Some(state) = changed {
            (self.inner.handler)(state);
        }
    }
}

fn set_state(state: &mut TrackerState, new_state: OnlineState) -> Option<OnlineState> {
    if state.state == new_state {
        return None;
    }
    state.state = new_state;
    Some(new_state)
}

fn clear_timer(state: &mut TrackerState) {
    if let Some(timer) = state.timer.take() {
        timer.cancel();
    }
}

fn log_offline(state: &mut TrackerState, details: &str) {
    let message = format!(
        "Could not reach Cloud Firestore backend. {details}\nThis typically indicates that your \
         device does not have a healthy Internet connection at the moment. The client will \
         operate in offline mode until it is able to successfully connect to the backend."
    );
    if state.should_warn_offline {
        log::warn!("{message}");
        state.should_warn_offline = false;
    } else {
        log::debug!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker() -> (OnlineStateTracker, Arc<StdMutex<Vec<OnlineState>>>, AsyncQueue) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = OnlineStateTracker::new(
            queue.clone(),
            Arc::new(move |state| sink.lock().unwrap().push(state)),
        );
        (tracker, seen, queue)
    }

    #[tokio::test]
    async fn single_failure_goes_offline() {
        let (tracker, seen, _queue) = tracker();
        tracker.handle_watch_stream_start();
        assert_eq!(tracker.state(), OnlineState::Unknown);
        tracker.handle_watch_stream_failure(&unavailable("down"));
        assert_eq!(tracker.state(), OnlineState::Offline);
        // Unknown was already the initial state, so only Offline is broadcast.
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn failure_while_online_returns_to_unknown() {
        let (tracker, seen, _queue) = tracker();
        tracker.set(OnlineState::Online);
        tracker.handle_watch_stream_failure(&unavailable("blip"));
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn timeout_reports_offline() {
        let (tracker, _seen, queue) = tracker();
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        queue.run_delayed_operations_early(TimerId::OnlineStateTimeout);
        queue.drain().await.unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);
    }

    #[tokio::test]
    async fn online_cancels_the_timeout() {
        let (tracker, _seen, queue) = tracker();
        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.state(), OnlineState::Online);
    }
}
