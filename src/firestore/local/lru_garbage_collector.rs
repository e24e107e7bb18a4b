use std::collections::{BTreeSet, BinaryHeap};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use crate::firestore::core::settings::LruParams;
use crate::firestore::error::{ignore_if_primary_lease_loss, FirestoreResult};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::mutation_queue::mutation_queues_contain_key;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::DocumentKeySet;
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Sentinel for "no sequence number".
pub const INVALID_SEQUENCE_NUMBER: i64 = -1;

const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

/// Outcome of one collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Keeps the `max_elements` smallest sequence numbers seen.
#[derive(Debug)]
pub struct RollingSequenceNumberBuffer {
    max_elements: usize,
    buffer: BinaryHeap<i64>,
}

impl RollingSequenceNumberBuffer {
    pub fn new(max_elements: usize) -> Self {
        Self {
            max_elements,
            buffer: BinaryHeap::with_capacity(max_elements + 1),
        }
    }

    pub fn add_element(&mut self, sequence_number: i64) {
        if self.buffer.len() < self.max_elements {
            self.buffer.push(sequence_number);
        } else if let Some(&highest) = self.buffer.peek() {
            if sequence_number < highest {
                self.buffer.pop();
                self.buffer.push(sequence_number);
            }
        }
    }

    /// Largest of the retained values, i.e. the n-th smallest overall.
    pub fn max_value(&self) -> i64 {
        self.buffer.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER)
    }
}

/// Least-recently-used collection of targets and the documents only they
/// referenced.
#[derive(Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: Arc<TargetCache>,
    remote_documents: Arc<RemoteDocumentCache>,
}

impl LruGarbageCollector {
    pub fn new(
        params: LruParams,
        target_cache: Arc<TargetCache>,
        remote_documents: Arc<RemoteDocumentCache>,
    ) -> Self {
        Self {
            params,
            target_cache,
            remote_documents,
        }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs a pass if the cache exceeds its size threshold. Targets in
    /// `active_target_ids`, `pinned_documents` and documents with pending
    /// writes survive.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<i32>,
        pinned_documents: &DocumentKeySet,
    ) -> FirestoreResult<LruResults> {
        if !self.params.is_enabled() {
            log::debug!("LRU garbage collection is disabled");
            return Ok(LruResults::did_not_run());
        }
        let cache_size = self.remote_documents.get_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "cache size {cache_size} is below the collection threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::did_not_run());
        }
        self.run_garbage_collection(txn, active_target_ids, pinned_documents)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<i32>,
        pinned_documents: &DocumentKeySet,
    ) -> FirestoreResult<LruResults> {
        let mut to_collect = self.calculate_target_count(txn, self.params.percentile_to_collect)?;
        if to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "capping garbage collection to {} sequence numbers (wanted {to_collect})",
                self.params.maximum_sequence_numbers_to_collect
            );
            to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = self.nth_sequence_number(txn, to_collect)?;
        let targets_removed = self
            .target_cache
            .remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, pinned_documents)?;
        log::debug!(
            "LRU garbage collection removed {targets_removed} targets and {documents_removed} \
             documents up to sequence number {upper_bound}"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }

    /// Number of sequence numbers making up `percentile` percent of all
    /// targets and orphaned documents.
    pub fn calculate_target_count(
        &self,
        txn: &PersistenceTransaction<'_>,
        percentile: u32,
    ) -> FirestoreResult<usize> {
        let count = self.get_sequence_number_count(txn)?;
        Ok((percentile as usize * count) / 100)
    }

    pub fn get_sequence_number_count(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<usize> {
        let targets = self.target_cache.get_target_count(txn)? as usize;
        let orphans = self.target_cache.get_orphaned_documents(txn)?.len();
        Ok(targets + orphans)
    }

    /// The `n`-th smallest sequence number across targets and orphaned
    /// documents.
    pub fn nth_sequence_number(&self, txn: &PersistenceTransaction<'_>, n: usize) -> FirestoreResult<i64> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        for target in self.target_cache.get_all_target_data(txn)? {
            buffer.add_element(target.sequence_number);
        }
        for (_, sequence_number) in self.target_cache.get_orphaned_documents(txn)? {
            buffer.add_element(sequence_number);
        }
        Ok(buffer.max_value())
    }

    /// Removes unreferenced documents last used at or before `upper_bound`,
    /// unless a local view or a pending write pins them.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: i64,
        pinned_documents: &DocumentKeySet,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for (key, sequence_number) in self.target_cache.get_orphaned_documents(txn)? {
            if sequence_number > upper_bound
                || pinned_documents.contains(&key)
                || mutation_queues_contain_key(txn, &key)
            {
                continue;
            }
            self.remote_documents.remove_entry(txn, &key)?;
            self.target_cache.remove_sentinel(txn, &key);
            removed += 1;
        }
        Ok(removed)
    }
}

/// Periodically runs garbage collection on the async queue: first after a
/// minute, then every five minutes.
pub struct LruScheduler {
    queue: AsyncQueue,
    local_store: Weak<LocalStore>,
    collector: Arc<LruGarbageCollector>,
    task: StdMutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(queue: AsyncQueue, local_store: &Arc<LocalStore>, collector: Arc<LruGarbageCollector>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            local_store: Arc::downgrade(local_store),
            collector,
            task: StdMutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.collector.params().is_enabled() {
            self.schedule(INITIAL_GC_DELAY);
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                scheduler.task.lock().unwrap().take();
                if let Some(local_store) = scheduler.local_store.upgrade() {
                    let result = local_store
                        .collect_garbage(&scheduler.collector)
                        .await
                        .map(|_| ());
                    if let Err(err) = ignore_if_primary_lease_loss(result) {
                        log::warn!("ignoring failure during LRU garbage collection: {err}");
                    }
                }
                scheduler.schedule(REGULAR_GC_DELAY);
            });
        *self.task.lock().unwrap() = Some(task);
    }
}
