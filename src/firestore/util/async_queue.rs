use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::FutureExt;

use crate::firestore::error::{cancelled, internal_error, FirestoreResult};
use crate::platform::runtime;

type Job = BoxFuture<'static, ()>;
type DelayedJob = Box<dyn FnOnce() -> Job + Send>;

/// Identifies the kind of a delayed operation so tests can fast-forward or
/// cancel a whole family of timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    IndexBackfill,
    TransactionRetry,
}

/// Serialized FIFO task queue.
///
/// Every operation of the synchronization engine runs as a job on this queue,
/// one at a time and in submission order. Jobs interleave only at their own
/// suspension points, never in parallel. Once restricted mode is entered
/// (during termination) new work is rejected with `Cancelled`.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

struct AsyncQueueInner {
    sender: async_channel::Sender<Job>,
    restricted: AtomicBool,
    failed: StdMutex<Option<String>>,
    delayed: StdMutex<Vec<DelayedEntry>>,
    next_delayed_id: AtomicU64,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    abort: AbortHandle,
    job: Option<DelayedJob>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        let inner = Arc::new(AsyncQueueInner {
            sender,
            restricted: AtomicBool::new(false),
            failed: StdMutex::new(None),
            delayed: StdMutex::new(Vec::new()),
            next_delayed_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        runtime::spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                let outcome = AssertUnwindSafe(job).catch_unwind().await;
                if let Err(panic) = outcome {
                    let message = panic_message(panic.as_ref());
                    log::error!("async queue job failed: {message}");
                    match weak.upgrade() {
                        Some(inner) => *inner.failed.lock().unwrap() = Some(message),
                        None => break,
                    }
                }
            }
        });

        Self { inner }
    }

    /// Runs `op` after every previously enqueued job and returns its result.
    ///
    /// Must not be awaited from inside another queued job; use
    /// [`enqueue_and_forget`](Self::enqueue_and_forget) there instead.
    pub async fn enqueue<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(cancelled("The client has already been terminated."));
        }
        self.enqueue_even_while_restricted(op).await
    }

    /// Like [`enqueue`](Self::enqueue) but accepted after restricted mode was
    /// entered. Used for the teardown steps themselves.
    pub async fn enqueue_even_while_restricted<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.verify_not_failed()?;
        let (tx, rx) = oneshot::channel();
        self.push(
            async move {
                let _ = tx.send(op.await);
            }
            .boxed(),
        )?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self
                .failure()
                .map(|message| internal_error(format!("AsyncQueue is already failed: {message}")))
                .unwrap_or_else(|| cancelled("The operation was cancelled."))),
        }
    }

    /// Schedules `op` without waiting for it. Dropped silently once the
    /// queue is restricted.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("dropping operation enqueued after termination");
            return;
        }
        if let Err(err) = self.push(op.boxed()) {
            log::debug!("failed to enqueue operation: {err}");
        }
    }

    /// Schedules `op` to be enqueued once `delay` has elapsed.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let (abort, registration) = AbortHandle::new_pair();
        let job: DelayedJob = Box::new(move || op().boxed());
        self.inner.delayed.lock().unwrap().push(DelayedEntry {
            id,
            timer_id,
            abort: abort.clone(),
            job: Some(job),
        });

        let weak = Arc::downgrade(&self.inner);
        let timer = Abortable::new(runtime::sleep(delay), registration);
        runtime::spawn_detached(async move {
            if timer.await.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let queue = AsyncQueue { inner };
                queue.fire_delayed(id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            queue: Arc::downgrade(&self.inner),
            abort,
        }
    }

    /// Returns `true` if a delayed operation with the given timer id is pending.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .delayed
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Skips the remaining delay of every pending operation with `timer_id`
    /// and enqueues it immediately, in scheduling order.
    pub fn run_delayed_operations_early(&self, timer_id: TimerId) {
        let ids: Vec<u64> = self
            .inner
            .delayed
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.timer_id == timer_id)
            .map(|entry| entry.id)
            .collect();
        for id in ids {
            self.fire_delayed(id);
        }
    }

    /// Waits until every job enqueued before this call has finished.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_restricted(async { Ok(()) }).await
    }

    /// Rejects all future work and cancels every pending delayed operation.
    pub fn enter_restricted_mode(&self) {
        self.inner.restricted.store(true, Ordering::SeqCst);
        let entries: Vec<DelayedEntry> = std::mem::take(&mut *self.inner.delayed.lock().unwrap());
        for entry in entries {
            entry.abort.abort();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.restricted.load(Ordering::SeqCst)
    }

    fn fire_delayed(&self, id: u64) {
        let job = {
            let mut delayed = self.inner.delayed.lock().unwrap();
            let position = delayed.iter().position(|entry| entry.id == id);
            position.and_then(|index| {
                let mut entry = delayed.remove(index);
                entry.abort.abort();
                entry.job.take()
            })
        };
        if let Some(job) = job {
            self.enqueue_and_forget(job());
        }
    }

    fn push(&self, job: Job) -> FirestoreResult<()> {
        self.inner
            .sender
            .try_send(job)
            .map_err(|err| internal_error(format!("failed to enqueue operation: {err}")))
    }

    fn verify_not_failed(&self) -> FirestoreResult<()> {
        match self.failure() {
            Some(message) => Err(internal_error(format!(
                "AsyncQueue is already failed: {message}"
            ))),
            None => Ok(()),
        }
    }

    fn failure(&self) -> Option<String> {
        self.inner.failed.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("restricted", &self.is_shutting_down())
            .field("failed", &self.failure())
            .finish()
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: Weak<AsyncQueueInner>,
    abort: AbortHandle,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Cancels the operation if it has not been enqueued yet.
    pub fn cancel(&self) {
        self.abort.abort();
        if let Some(inner) = self.queue.upgrade() {
            inner
                .delayed
                .lock()
                .unwrap()
                .retain(|entry| entry.id != self.id);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[tokio::test]
    async fn runs_jobs_in_fifo_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for index in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(async move {
                runtime::yield_now().await;
                log.lock().unwrap().push(index);
            });
        }
        queue.drain().await.expect("drain");
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn restricted_mode_rejects_new_work() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode();
        let err = queue
            .enqueue(async { Ok(()) })
            .await
            .expect_err("restricted queue");
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        queue
            .enqueue_even_while_restricted(async { Ok(()) })
            .await
            .expect("teardown work still runs");
    }

    #[tokio::test]
    async fn delayed_operations_can_be_cancelled_or_fast_forwarded() {
        let queue = AsyncQueue::new();
        let fired = Arc::new(AtomicBool::new(false));

        let cancelled_op = {
            let fired = Arc::clone(&fired);
            queue.enqueue_after_delay(TimerId::TransactionRetry, Duration::from_secs(60), move || {
                async move { fired.store(true, Ordering::SeqCst) }
            })
        };
        cancelled_op.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::TransactionRetry));

        let gc_ran = Arc::new(AtomicBool::new(false));
        {
            let gc_ran = Arc::clone(&gc_ran);
            queue.enqueue_after_delay(
                TimerId::LruGarbageCollection,
                Duration::from_secs(300),
                move || async move { gc_ran.store(true, Ordering::SeqCst) },
            );
        }
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
        queue.run_delayed_operations_early(TimerId::LruGarbageCollection);
        queue.drain().await.expect("drain");

        assert!(gc_ran.load(Ordering::SeqCst));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_job_fails_the_queue() {
        let queue = AsyncQueue::new();
        let result = queue
            .enqueue(async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await;
        assert!(result.is_err());
        let err = queue.enqueue(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
    }
}
