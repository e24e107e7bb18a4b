use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::firestore::error::{unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::StreamHandle;
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::platform::runtime;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

/// An open stream with nothing left to send is closed after this long.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> Error -> Backoff -> Starting ...
///              |          |
///              +----------+----> Initial (stop / idle)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Initial,
    Starting,
    Open,
    /// Closed after a failure. The next start waits for the backoff delay.
    Error,
    Backoff,
}

/// Receives the events of a [`PersistentStream`]. Every callback runs as a
/// job on the client's async queue.
#[async_trait]
pub trait StreamListener<Response>: Send + Sync {
    async fn on_open(&self);

    /// An error closes the stream as if the backend had failed it.
    async fn on_message(&self, message: Response) -> FirestoreResult<()>;

    /// `None` when the stream was stopped deliberately.
    async fn on_close(&self, error: Option<FirestoreError>);
}

pub type StreamOpener<Request, Response> =
    Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<Arc<dyn StreamHandle<Request, Response>>>> + Send + Sync>;

/// Timers a stream schedules on the async queue.
#[derive(Clone, Copy, Debug)]
pub struct StreamTimers {
    pub idle: TimerId,
    pub backoff: TimerId,
}

/// Long-lived stream that reconnects with exponential backoff.
///
/// The stream never restarts on its own: after a failure its owner calls
/// [`start`](Self::start) again, which waits for the backoff delay before
/// reconnecting. Events from a previous connection are discarded once the
/// stream was closed, so a listener never sees messages from a stream it
/// already got `on_close` for.
pub struct PersistentStream<Request, Response> {
    inner: Arc<StreamInner<Request, Response>>,
}

impl<Request, Response> Clone for PersistentStream<Request, Response> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StreamInner<Request, Response> {
    label: &'static str,
    queue: AsyncQueue,
    opener: StreamOpener<Request, Response>,
    timers: StreamTimers,
    listener: Weak<dyn StreamListener<Response>>,
    state: StdMutex<StreamState<Request, Response>>,
}

struct StreamState<Request, Response> {
    phase: StreamPhase,
    /// Bumped on every close; stale callbacks compare against it.
    generation: u64,
    handle: Option<Arc<dyn StreamHandle<Request, Response>>>,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
}

impl<Request, Response> PersistentStream<Request, Response>
where
    Request: Send + 'static,
    Response: Send + 'static,
{
    pub fn new(
        label: &'static str,
        queue: AsyncQueue,
        opener: StreamOpener<Request, Response>,
        timers: StreamTimers,
        listener: Weak<dyn StreamListener<Response>>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                label,
                queue,
                opener,
                timers,
                listener,
                state: StdMutex::new(StreamState {
                    phase: StreamPhase::Initial,
                    generation: 0,
                    handle: None,
                    backoff: ExponentialBackoff::new(BackoffConfig::default()),
                    idle_timer: None,
                    backoff_timer: None,
                }),
            }),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.inner.state.lock().unwrap().phase
    }

    /// Whether the stream is connecting, connected or waiting to reconnect.
    pub fn is_started(&self) -> bool {
        is_started(self.phase())
    }

    pub fn is_open(&self) -> bool {
        self.phase() == StreamPhase::Open
    }

    /// Opens the stream, after the backoff delay if the last attempt failed.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        match state.phase {
            StreamPhase::Error => {
                self.perform_backoff(&mut state);
                return;
            }
            StreamPhase::Initial => {}
            phase => {
                log::debug!("{} stream already started ({phase:?})", self.inner.label);
                return;
            }
        }
        state.phase = StreamPhase::Starting;
        let generation = state.generation;
        drop(state);

        log::debug!("opening {} stream", self.inner.label);
        let stream = self.clone();
        let opener = Arc::clone(&self.inner.opener);
        runtime::spawn_detached(async move {
            let result = opener().await;
            let queue = stream.inner.queue.clone();
            queue.enqueue_and_forget(async move { stream.handle_open_result(generation, result).await });
        });
    }

    /// Closes the stream without an error and resets the backoff.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(StreamPhase::Initial, None).await;
        }
    }

    /// Makes the next start connect immediately instead of waiting for the
    /// backoff delay. Ignored while the stream is started.
    pub fn inhibit_backoff(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if is_started(state.phase) {
            return;
        }
        state.phase = StreamPhase::Initial;
        state.backoff.reset();
    }

    /// Arms the idle timer. Sending anything disarms it.
    pub fn mark_idle(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.phase != StreamPhase::Open || state.idle_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        state.idle_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.timers.idle,
            IDLE_TIMEOUT,
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    PersistentStream { inner }.handle_idle_timeout().await;
                }
            },
        ));
    }

    /// Sends `request` on the open connection. A send failure closes the
    /// stream with that error.
    pub async fn send(&self, request: Request) {
        let (handle, generation) = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            (state.handle.clone(), state.generation)
        };
        let Some(handle) = handle else {
            log::debug!("dropping request on closed {} stream", self.inner.label);
            return;
        };
        if let Err(error) = handle.send(request).await {
            let stream = self.clone();
            self.inner
                .queue
                .enqueue_and_forget(async move { stream.handle_stream_failure(generation, error).await });
        }
    }

    async fn close(&self, final_phase: StreamPhase, error: Option<FirestoreError>) {
        let handle = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = state.backoff_timer.take() {
                timer.cancel();
            }
            state.generation += 1;
            if final_phase != StreamPhase::Error {
                state.backoff.reset();
            } else if error
                .as_ref()
                .is_some_and(|error| error.code == FirestoreErrorCode::ResourceExhausted)
            {
                log::debug!("{} stream exhausted a backend quota, using the maximum backoff", self.inner.label);
                state.backoff.reset_to_max();
            }
            state.phase = final_phase;
            state.handle.take()
        };
        if let Some(handle) = handle {
            handle.close();
        }
        if let Some(listener) = self.inner.listener.upgrade() {
            listener.on_close(error).await;
        }
    }

    async fn handle_open_result(
        &self,
        generation: u64,
        result: FirestoreResult<Arc<dyn StreamHandle<Request, Response>>>,
    ) {
        let handle = {
            let mut state = self.inner.state.lock().unwrap();
            if state.generation != generation || state.phase != StreamPhase::Starting {
                if let Ok(handle) = &result {
                    handle.close();
                }
                return;
            }
            match result {
                Ok(handle) => {
                    state.phase = StreamPhase::Open;
                    state.handle = Some(Arc::clone(&handle));
                    Ok(handle)
                }
                Err(error) => Err(error),
            }
        };
        match handle {
            Ok(handle) => {
                log::debug!("{} stream open", self.inner.label);
                self.spawn_reader(generation, handle);
                if let Some(listener) = self.inner.listener.upgrade() {
                    listener.on_open().await;
                }
            }
            Err(error) => {
                log::debug!("{} stream failed to open: {error}", self.inner.label);
                self.close(StreamPhase::Error, Some(error)).await;
            }
        }
    }

    fn spawn_reader(&self, generation: u64, handle: Arc<dyn StreamHandle<Request, Response>>) {
        let weak = Arc::downgrade(&self.inner);
        let queue = self.inner.queue.clone();
        runtime::spawn_detached(async move {
            loop {
                let next = handle.next().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let stream = PersistentStream { inner };
                match next {
                    Some(Ok(message)) => {
                        queue.enqueue_and_forget(async move { stream.handle_message(generation, message).await });
                    }
                    Some(Err(error)) => {
                        queue.enqueue_and_forget(async move { stream.handle_stream_failure(generation, error).await });
                        return;
                    }
                    None => {
                        let error = unavailable("The stream was closed by the backend");
                        queue.enqueue_and_forget(async move { stream.handle_stream_failure(generation, error).await });
                        return;
                    }
                }
            }
        });
    }

    async fn handle_message(&self, generation: u64, message: Response) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            state.backoff.reset();
        }
        let Some(listener) = self.inner.listener.upgrade() else {
            return;
        };
        if let Err(error) = listener.on_message(message).await {
            log::warn!("{} stream message could not be handled: {error}", self.inner.label);
            self.handle_stream_failure(generation, error).await;
        }
    }

    async fn handle_stream_failure(&self, generation: u64, error: FirestoreError) {
        if self.inner.state.lock().unwrap().generation != generation {
            return;
        }
        log::debug!("{} stream failed: {error}", self.inner.label);
        self.close(StreamPhase::Error, Some(error)).await;
    }

    async fn handle_idle_timeout(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.idle_timer = None;
            if state.phase != StreamPhase::Open {
                return;
            }
        }
        log::debug!("closing idle {} stream", self.inner.label);
        self.close(StreamPhase::Initial, None).await;
    }

    fn perform_backoff(&self, state: &mut StreamState<Request, Response>) {
        state.phase = StreamPhase::Backoff;
        let generation = state.generation;
        let delay = state.backoff.next_delay();
        let weak = Arc::downgrade(&self.inner);
        state.backoff_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.timers.backoff,
            delay,
            move || async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let stream = PersistentStream { inner };
                {
                    let mut state = stream.inner.state.lock().unwrap();
                    state.backoff_timer = None;
                    if state.generation != generation || state.phase != StreamPhase::Backoff {
                        return;
                    }
                    state.phase = StreamPhase::Initial;
                }
                stream.start();
            },
        ));
    }
}

fn is_started(phase: StreamPhase) -> bool {
    matches!(phase, StreamPhase::Starting | StreamPhase::Open | StreamPhase::Backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::{QueryPurpose, TargetData};
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::datastore::{Datastore, MockDatastore, WatchRequest, WatchResponse};
    use futures::FutureExt;

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Message,
        Close(Option<FirestoreErrorCode>),
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<Event>>,
    }

    #[async_trait]
    impl StreamListener<WatchResponse> for Recorder {
        async fn on_open(&self) {
            self.events.lock().unwrap().push(Event::Open);
        }

        async fn on_message(&self, _message: WatchResponse) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(Event::Message);
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) {
            self.events.lock().unwrap().push(Event::Close(error.map(|error| error.code)));
        }
    }

    fn watch_stream(
        datastore: &MockDatastore,
        queue: &AsyncQueue,
        recorder: &Arc<Recorder>,
    ) -> PersistentStream<WatchRequest, WatchResponse> {
        let datastore = datastore.clone();
        let opener: StreamOpener<WatchRequest, WatchResponse> = Arc::new(move || {
            let datastore = datastore.clone();
            async move { datastore.open_watch_stream().await }.boxed()
        });
        let listener: Arc<dyn StreamListener<WatchResponse>> = recorder.clone();
        PersistentStream::new(
            "watch",
            queue.clone(),
            opener,
            StreamTimers {
                idle: TimerId::ListenStreamIdle,
                backoff: TimerId::ListenStreamConnectionBackoff,
            },
            Arc::downgrade(&listener),
        )
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..5 {
            runtime::sleep(Duration::from_millis(10)).await;
            queue.drain().await.unwrap();
        }
    }

    #[tokio::test]
    async fn delivers_messages_after_open() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        let queue = AsyncQueue::new();
        let recorder = Arc::new(Recorder::default());
        let stream = watch_stream(&datastore, &queue, &recorder);

        stream.start();
        assert_eq!(stream.phase(), StreamPhase::Starting);
        settle(&queue).await;
        assert!(stream.is_open());

        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).listen_target();
        stream
            .send(WatchRequest::Listen(TargetData::new(target, 2, QueryPurpose::Listen, 1)))
            .await;
        settle(&queue).await;

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0], Event::Open);
        // Added, Current and the global snapshot.
        assert_eq!(events.iter().filter(|event| **event == Event::Message).count(), 3);
    }

    #[tokio::test]
    async fn failed_open_backs_off_before_retrying() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        datastore.set_network_available(false);
        let queue = AsyncQueue::new();
        let recorder = Arc::new(Recorder::default());
        let stream = watch_stream(&datastore, &queue, &recorder);

        stream.start();
        settle(&queue).await;
        assert_eq!(stream.phase(), StreamPhase::Error);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![Event::Close(Some(FirestoreErrorCode::Unavailable))]
        );

        datastore.set_network_available(true);
        stream.start();
        assert_eq!(stream.phase(), StreamPhase::Backoff);
        queue.run_delayed_operations_early(TimerId::ListenStreamConnectionBackoff);
        settle(&queue).await;
        assert!(stream.is_open());
        assert_eq!(datastore.watch_stream_count(), 1);
    }

    #[tokio::test]
    async fn idle_stream_closes_cleanly() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        let queue = AsyncQueue::new();
        let recorder = Arc::new(Recorder::default());
        let stream = watch_stream(&datastore, &queue, &recorder);

        stream.start();
        settle(&queue).await;
        stream.mark_idle();
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        queue.run_delayed_operations_early(TimerId::ListenStreamIdle);
        settle(&queue).await;

        assert_eq!(stream.phase(), StreamPhase::Initial);
        assert_eq!(
            recorder.events.lock().unwrap().last(),
            Some(&Event::Close(None))
        );
    }

    #[tokio::test]
    async fn backend_failure_closes_with_error() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        let queue = AsyncQueue::new();
        let recorder = Arc::new(Recorder::default());
        let stream = watch_stream(&datastore, &queue, &recorder);

        stream.start();
        settle(&queue).await;
        datastore.set_network_available(false);
        settle(&queue).await;

        assert_eq!(stream.phase(), StreamPhase::Error);
        assert_eq!(
            recorder.events.lock().unwrap().last(),
            Some(&Event::Close(Some(FirestoreErrorCode::Unavailable)))
        );
    }
}
