//! Storage layer: the persisted run state and the compare-and-set
//! interface the engine coordinates through.
//!
//! The store is the only shared mutable resource. Two invocations of the
//! same run (a resumed one racing a stale one, say) never coordinate
//! in-process; every status change is a conditional write keyed by
//! `(run_id, action_id, expected status)`, and losing one is a normal
//! outcome reported as [`Cas::Conflict`].
//!
//! Backends:
//!
//! - [`InMemoryStateStore`]: `DashMap`-backed, for tests and single-process use
//! - [`SqliteStateStore`]: durable SQLite storage via `sqlx` (feature `sqlite`)
//!
//! # Example
//!
//! ```
//! use actiongraph::storage::{InMemoryStateStore, StateStore};
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStateStore::new();
//! assert!(store.get(Uuid::new_v4()).await?.is_none());
//! # Ok(())
//! # }
//! ```

use crate::core::{ActionRecord, ActionStatus, RollbackFailure, Run, RunState, RunStatus};
use crate::graph::ActionId;
use async_trait::async_trait;
use uuid::Uuid;

mod error;
pub mod memory;
mod params;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::{Result, StorageError};
pub use memory::InMemoryStateStore;
pub use params::TransitionMetadata;

#[cfg(feature = "sqlite")]
pub use sqlite::{PoolConfig, SqliteStateStore};

/// Outcome of a conditional write.
///
/// Both variants carry the record as it is stored after the call: the
/// updated record when the write applied, the current (unchanged) one when
/// it lost.
#[derive(Debug, Clone, PartialEq)]
pub enum Cas<T> {
    Applied(T),
    Conflict(T),
}

impl<T> Cas<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Cas::Applied(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Cas::Conflict(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Cas::Applied(value) => Some(value),
            Cas::Conflict(_) => None,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Cas::Applied(value) | Cas::Conflict(value) => value,
        }
    }
}

/// Trait for run state storage backends.
///
/// Implementations must be safe to share between invocations and must make
/// each conditional write atomic with respect to every other write to the
/// same run.
///
/// Besides the expected-status check, [`StateStore::conditional_set`]
/// enforces two rules so that no caller can bypass them:
///
/// - an action may only newly enter `running` while its run is `running`
/// - while an action is `running`, a caller presenting a different claim
///   token than the one it was claimed with loses
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the full state of a run.
    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>>;

    /// Replaces the whole state of a run.
    async fn put(&self, run_id: Uuid, state: &RunState) -> Result<()>;

    /// Inserts a new run if none exists under its id. On conflict the
    /// existing state is returned.
    async fn create(&self, state: &RunState) -> Result<Cas<RunState>>;

    /// Moves one action from `expected` to `next`.
    ///
    /// # Errors
    ///
    /// `RunNotFound`/`ActionNotFound` for unknown ids, and
    /// `CoreError::IllegalTransition` if `expected -> next` is not an edge of
    /// the action state machine.
    async fn conditional_set(
        &self,
        run_id: Uuid,
        action_id: &ActionId,
        expected: ActionStatus,
        next: ActionStatus,
        metadata: TransitionMetadata,
    ) -> Result<Cas<ActionRecord>>;

    /// Moves the run from `expected` to `next`.
    async fn conditional_set_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Cas<Run>>;

    /// Appends a rollback failure to the run, replacing any earlier entry
    /// for the same action.
    async fn record_rollback_failure(&self, run_id: Uuid, failure: RollbackFailure) -> Result<()>;
}

pub(crate) fn check_run_transition(expected: RunStatus, next: RunStatus) -> Result<()> {
    expected.check_transition(next).map_err(StorageError::from)
}

pub(crate) fn check_action_transition(expected: ActionStatus, next: ActionStatus) -> Result<()> {
    expected.check_transition(next).map_err(StorageError::from)
}

/// Returns true if moving an action from `current` to `next` would start
/// it, which is only allowed while the run is running.
pub(crate) fn starts_action(current: ActionStatus, next: ActionStatus) -> bool {
    next == ActionStatus::Running && current != ActionStatus::Running
}

// Implement StateStore for Box<dyn StateStore> to allow type-erased storage
#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>> {
        (**self).get(run_id).await
    }

    async fn put(&self, run_id: Uuid, state: &RunState) -> Result<()> {
        (**self).put(run_id, state).await
    }

    async fn create(&self, state: &RunState) -> Result<Cas<RunState>> {
        (**self).create(state).await
    }

    async fn conditional_set(
        &self,
        run_id: Uuid,
        action_id: &ActionId,
        expected: ActionStatus,
        next: ActionStatus,
        metadata: TransitionMetadata,
    ) -> Result<Cas<ActionRecord>> {
        (**self)
            .conditional_set(run_id, action_id, expected, next, metadata)
            .await
    }

    async fn conditional_set_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Cas<Run>> {
        (**self).conditional_set_run(run_id, expected, next).await
    }

    async fn record_rollback_failure(&self, run_id: Uuid, failure: RollbackFailure) -> Result<()> {
        (**self).record_rollback_failure(run_id, failure).await
    }
}

#[async_trait]
impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>> {
        (**self).get(run_id).await
    }

    async fn put(&self, run_id: Uuid, state: &RunState) -> Result<()> {
        (**self).put(run_id, state).await
    }

    async fn create(&self, state: &RunState) -> Result<Cas<RunState>> {
        (**self).create(state).await
    }

    async fn conditional_set(
        &self,
        run_id: Uuid,
        action_id: &ActionId,
        expected: ActionStatus,
        next: ActionStatus,
        metadata: TransitionMetadata,
    ) -> Result<Cas<ActionRecord>> {
        (**self)
            .conditional_set(run_id, action_id, expected, next, metadata)
            .await
    }

    async fn conditional_set_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Cas<Run>> {
        (**self).conditional_set_run(run_id, expected, next).await
    }

    async fn record_rollback_failure(&self, run_id: Uuid, failure: RollbackFailure) -> Result<()> {
        (**self).record_rollback_failure(run_id, failure).await
    }
}
