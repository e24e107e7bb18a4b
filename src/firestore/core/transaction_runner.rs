use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;

use crate::firestore::constants::DEFAULT_TRANSACTION_MAX_ATTEMPTS;
use crate::firestore::core::transaction::Transaction;
use crate::firestore::error::{cancelled, is_retryable_transaction_error, FirestoreError, FirestoreResult};
use crate::firestore::remote::Datastore;
use crate::firestore::util::async_queue::{AsyncQueue, TimerId};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

/// Options of [`TransactionRunner`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransactionOptions {
    pub max_attempts: u32,
    /// Delays between attempts.
    pub backoff: BackoffConfig,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_TRANSACTION_MAX_ATTEMPTS,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Runs an update function in a fresh [`Transaction`] until it commits,
/// fails permanently or runs out of attempts. Retries wait on
/// [`TimerId::TransactionRetry`] with exponential backoff.
pub struct TransactionRunner<F> {
    queue: AsyncQueue,
    datastore: Arc<dyn Datastore>,
    update_fn: F,
    attempts_remaining: u32,
    backoff: ExponentialBackoff,
}

impl<F, Fut, T> TransactionRunner<F>
where
    F: Fn(Arc<Transaction>) -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    pub fn new(queue: AsyncQueue, datastore: Arc<dyn Datastore>, options: TransactionOptions, update_fn: F) -> Self {
        Self {
            queue,
            datastore,
            update_fn,
            attempts_remaining: options.max_attempts,
            backoff: ExponentialBackoff::new(options.backoff),
        }
    }

    pub async fn run(mut self) -> FirestoreResult<T> {
        loop {
            self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
            self.wait_for_backoff().await?;

            let transaction = Arc::new(Transaction::new(Arc::clone(&self.datastore)));
            let result = match (self.update_fn)(Arc::clone(&transaction)).await {
                Ok(value) => transaction.commit().await.map(|()| value),
                Err(err) => Err(err),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if self.attempts_remaining > 0 && is_retryable(&err) => {
                    log::debug!("retrying transaction after {err}; {} attempts left", self.attempts_remaining);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn wait_for_backoff(&mut self) -> FirestoreResult<()> {
        let delay = self.backoff.next_delay();
        if delay.is_zero() {
            return Ok(());
        }
        let (sender, receiver) = oneshot::channel();
        let _timer = self
            .queue
            .enqueue_after_delay(TimerId::TransactionRetry, delay, move || async move {
                let _ = sender.send(());
            });
        receiver
            .await
            .map_err(|_| cancelled("The transaction was cancelled while waiting to retry."))
    }
}

/// Only contention (`Aborted`, `FailedPrecondition`, `AlreadyExists`) is
/// retried; every other error surfaces from the first attempt.
fn is_retryable(error: &FirestoreError) -> bool {
    is_retryable_transaction_error(error.code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{aborted, permission_denied, unavailable, FirestoreErrorCode};
    use crate::firestore::model::{DatabaseId, DocumentKey, FieldPath};
    use crate::firestore::remote::MockDatastore;
    use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(count: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_segment("count"), FirestoreValue::from_integer(count));
        map
    }

    fn without_delays(max_attempts: u32) -> TransactionOptions {
        TransactionOptions {
            max_attempts,
            backoff: BackoffConfig {
                initial_delay_millis: 0,
                backoff_factor: 1.0,
                max_delay_millis: 0,
            },
        }
    }

    #[tokio::test]
    async fn retries_after_a_concurrent_change() {
        let queue = AsyncQueue::new();
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        datastore.set_document(key("counters/a"), data(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let backend = datastore.clone();
        let counter = Arc::clone(&attempts);
        let runner = TransactionRunner::new(
            queue,
            Arc::new(datastore.clone()),
            without_delays(5),
            move |transaction: Arc<Transaction>| {
                let backend = backend.clone();
                let counter = Arc::clone(&counter);
                async move {
                    let document = transaction.get(&key("counters/a")).await?;
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Someone else writes between our read and commit.
                        backend.set_document(key("counters/a"), data(10));
                    }
                    let count = match document.field(&FieldPath::from_segment("count")).map(FirestoreValue::kind) {
                        Some(ValueKind::Integer(count)) => *count,
                        _ => 0,
                    };
                    transaction.set(key("counters/a"), data(count + 1));
                    Ok(count + 1)
                }
            },
        );

        assert_eq!(runner.run().await.unwrap(), 11);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(datastore.document(&key("counters/a")).unwrap().data(), &data(11));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let runner = TransactionRunner::new(
            queue,
            Arc::new(MockDatastore::new(DatabaseId::default("p"))),
            without_delays(3),
            move |_transaction: Arc<Transaction>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(aborted("contention")) }
            },
        );

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Aborted);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let runner = TransactionRunner::new(
            AsyncQueue::new(),
            Arc::new(MockDatastore::new(DatabaseId::default("p"))),
            TransactionOptions::default(),
            move |_transaction: Arc<Transaction>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(permission_denied("denied")) }
            },
        );

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_from_the_update_function_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let runner = TransactionRunner::new(
            AsyncQueue::new(),
            Arc::new(MockDatastore::new(DatabaseId::default("p"))),
            without_delays(5),
            move |_transaction: Arc<Transaction>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unavailable("backend unreachable")) }
            },
        );

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
