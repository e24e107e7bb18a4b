use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Mutex as StdMutex;

use crate::firestore::core::user::User;
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::online_state_tracker::OnlineState;

/// Sync state of a query target as shared between clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// Outcome of a mutation batch as shared between clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

/// Coordination channel between clients sharing one durable store.
///
/// The primary client owns the network and garbage collection; secondaries
/// learn about query and mutation state changes through this collaborator.
/// Only the in-process implementation ships with this crate.
pub trait SharedClientState: Send + Sync + Debug {
    fn add_pending_mutation(&self, batch_id: i32);

    fn update_mutation_state(&self, batch_id: i32, state: MutationBatchState, error: Option<&FirestoreError>);

    /// Starts tracking `target_id` for this client and returns the state
    /// other clients last reported for it.
    fn add_local_query_target(&self, target_id: i32) -> QueryTargetState;

    fn remove_local_query_target(&self, target_id: i32);

    fn is_local_query_target(&self, target_id: i32) -> bool;

    /// Whether any client listens to `target_id`.
    fn is_active_query_target(&self, target_id: i32) -> bool;

    fn update_query_state(&self, target_id: i32, state: QueryTargetState, error: Option<&FirestoreError>);

    fn clear_query_state(&self, target_id: i32);

    fn get_all_active_query_targets(&self) -> BTreeSet<i32>;

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[i32], added_batch_ids: &[i32]);

    fn set_online_state(&self, online_state: OnlineState);

    fn write_sequence_number(&self, sequence_number: i64);
}

#[derive(Debug, Default)]
struct MemoryState {
    local_targets: BTreeSet<i32>,
    query_states: BTreeMap<i32, QueryTargetState>,
    mutation_states: BTreeMap<i32, MutationBatchState>,
    online_state: Option<OnlineState>,
    sequence_number: i64,
    user: User,
}

/// Single-client [`SharedClientState`]: every active target is local.
#[derive(Debug, Default)]
pub struct MemorySharedClientState {
    state: StdMutex<MemoryState>,
}

impl MemorySharedClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutation_state(&self, batch_id: i32) -> Option<MutationBatchState> {
        self.state.lock().unwrap().mutation_states.get(&batch_id).copied()
    }

    pub fn query_state(&self, target_id: i32) -> Option<QueryTargetState> {
        self.state.lock().unwrap().query_states.get(&target_id).copied()
    }

    pub fn online_state(&self) -> Option<OnlineState> {
        self.state.lock().unwrap().online_state
    }

    pub fn sequence_number(&self) -> i64 {
        self.state.lock().unwrap().sequence_number
    }
}

impl SharedClientState for MemorySharedClientState {
    fn add_pending_mutation(&self, batch_id: i32) {
        self.state
            .lock()
            .unwrap()
            .mutation_states
            .insert(batch_id, MutationBatchState::Pending);
    }

    fn update_mutation_state(&self, batch_id: i32, state: MutationBatchState, error: Option<&FirestoreError>) {
        if let Some(error) = error {
            log::debug!("mutation batch {batch_id} is {state:?}: {error}");
        }
        let mut inner = self.state.lock().unwrap();
        match state {
            MutationBatchState::Pending => {
                inner.mutation_states.insert(batch_id, state);
            }
            // Settled batches are no longer of interest to anyone.
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                inner.mutation_states.remove(&batch_id);
            }
        }
    }

    fn add_local_query_target(&self, target_id: i32) -> QueryTargetState {
        let mut inner = self.state.lock().unwrap();
        inner.local_targets.insert(target_id);
        *inner
            .query_states
            .entry(target_id)
            .or_insert(QueryTargetState::NotCurrent)
    }

    fn remove_local_query_target(&self, target_id: i32) {
        self.state.lock().unwrap().local_targets.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: i32) -> bool {
        self.state.lock().unwrap().local_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: i32) -> bool {
        self.is_local_query_target(target_id)
    }

    fn update_query_state(&self, target_id: i32, state: QueryTargetState, error: Option<&FirestoreError>) {
        if let Some(error) = error {
            log::debug!("query target {target_id} is {state:?}: {error}");
        }
        self.state.lock().unwrap().query_states.insert(target_id, state);
    }

    fn clear_query_state(&self, target_id: i32) {
        self.state.lock().unwrap().query_states.remove(&target_id);
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<i32> {
        self.state.lock().unwrap().local_targets.clone()
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[i32], added_batch_ids: &[i32]) {
        let mut inner = self.state.lock().unwrap();
        for batch_id in removed_batch_ids {
            inner.mutation_states.remove(batch_id);
        }
        for batch_id in added_batch_ids {
            inner.mutation_states.insert(*batch_id, MutationBatchState::Pending);
        }
        inner.user = user.clone();
    }

    fn set_online_state(&self, online_state: OnlineState) {
        self.state.lock().unwrap().online_state = Some(online_state);
    }

    fn write_sequence_number(&self, sequence_number: i64) {
        self.state.lock().unwrap().sequence_number = sequence_number;
    }
}
