use super::{
    check_action_transition, check_run_transition, error::Result, error::StorageError,
    starts_action, Cas, StateStore, TransitionMetadata,
};
use crate::core::{ActionRecord, ActionStatus, RollbackFailure, Run, RunState, RunStatus};
use crate::graph::ActionId;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// In-memory state store using DashMap for concurrent access.
///
/// Each run is one map entry. Every conditional write holds that entry's
/// shard lock for the compare and the update, so writes to the same run are
/// atomic with respect to each other while different runs proceed in
/// parallel.
///
/// State lives only as long as the process; use the SQLite backend for
/// anything that must survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    runs: DashMap<Uuid, RunState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>> {
        Ok(self.runs.get(&run_id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, run_id: Uuid, state: &RunState) -> Result<()> {
        self.runs.insert(run_id, state.clone());
        Ok(())
    }

    async fn create(&self, state: &RunState) -> Result<Cas<RunState>> {
        match self.runs.entry(state.run.run_id) {
            Entry::Occupied(existing) => Ok(Cas::Conflict(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
                Ok(Cas::Applied(state.clone()))
            }
        }
    }

    async fn conditional_set(
        &self,
        run_id: Uuid,
        action_id: &ActionId,
        expected: ActionStatus,
        next: ActionStatus,
        metadata: TransitionMetadata,
    ) -> Result<Cas<ActionRecord>> {
        check_action_transition(expected, next)?;

        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(StorageError::RunNotFound(run_id))?;
        let state = entry.value_mut();
        let run_status = state.run.status;

        let record = state
            .actions
            .get_mut(action_id)
            .ok_or_else(|| StorageError::ActionNotFound {
                run_id,
                action_id: action_id.clone(),
            })?;

        if record.status != expected
            || !metadata.claim_matches(record)
            || (starts_action(record.status, next) && run_status != RunStatus::Running)
        {
            return Ok(Cas::Conflict(record.clone()));
        }

        metadata.apply(record, next, Utc::now());
        Ok(Cas::Applied(record.clone()))
    }

    async fn conditional_set_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Cas<Run>> {
        check_run_transition(expected, next)?;

        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(StorageError::RunNotFound(run_id))?;
        let run = &mut entry.value_mut().run;

        if run.status != expected {
            return Ok(Cas::Conflict(run.clone()));
        }

        run.status = next;
        run.updated_at = Utc::now();
        Ok(Cas::Applied(run.clone()))
    }

    async fn record_rollback_failure(&self, run_id: Uuid, failure: RollbackFailure) -> Result<()> {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(StorageError::RunNotFound(run_id))?;
        let failures = &mut entry.value_mut().rollback_failures;
        failures.retain(|f| f.action_id != failure.action_id);
        failures.push(failure);
        Ok(())
    }
}
