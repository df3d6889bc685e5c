use super::error::{ExecutionError, Result};
use crate::core::{retry_with_policy, ActionRecord, ActionStatus, RetryPolicy, RollbackFailure, Run, RunState, RunStatus};
use crate::graph::ActionId;
use crate::storage::{Cas, StateStore, TransitionMetadata};
use std::sync::Arc;
use uuid::Uuid;

/// A state store whose calls are retried on transient storage errors.
///
/// Conflicts are returned, never retried: a lost compare-and-set means
/// someone else moved the record and the caller has to look again.
pub(crate) struct RetryingStore<S: ?Sized> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: ?Sized> Clone for RetryingStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policy: self.policy,
        }
    }
}

impl<S: StateStore + ?Sized> RetryingStore<S> {
    pub(crate) fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub(crate) async fn get(&self, run_id: Uuid) -> Result<Option<RunState>> {
        let store = &self.store;
        Ok(retry_with_policy(self.policy, |_| store.get(run_id)).await?)
    }

    /// Like [`RetryingStore::get`] but a missing run is an error.
    pub(crate) async fn load(&self, run_id: Uuid) -> Result<RunState> {
        self.get(run_id)
            .await?
            .ok_or(ExecutionError::RunNotFound(run_id))
    }

    pub(crate) async fn create(&self, state: &RunState) -> Result<Cas<RunState>> {
        let store = &self.store;
        Ok(retry_with_policy(self.policy, |_| store.create(state)).await?)
    }

    pub(crate) async fn set_action(
        &self,
        run_id: Uuid,
        action_id: &ActionId,
        expected: ActionStatus,
        next: ActionStatus,
        metadata: TransitionMetadata,
    ) -> Result<Cas<ActionRecord>> {
        let store = &self.store;
        Ok(retry_with_policy(self.policy, |_| {
            store.conditional_set(run_id, action_id, expected, next, metadata.clone())
        })
        .await?)
    }

    pub(crate) async fn set_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Cas<Run>> {
        let store = &self.store;
        Ok(retry_with_policy(self.policy, |_| store.conditional_set_run(run_id, expected, next)).await?)
    }

    pub(crate) async fn record_rollback_failure(
        &self,
        run_id: Uuid,
        failure: RollbackFailure,
    ) -> Result<()> {
        let store = &self.store;
        Ok(retry_with_policy(self.policy, |_| {
            store.record_rollback_failure(run_id, failure.clone())
        })
        .await?)
    }
}
