//! Resumer - adopts the persisted state of a run at the start of an
//! invocation.
//!
//! A run is created on its first invocation and adopted by every later one.
//! Actions left `running` by an invocation that went away (a time-limit
//! truncation, a crash) are reclaimed once they have gone without progress
//! for longer than the configured staleness threshold.

use super::config::EngineConfig;
use super::error::{ExecutionError, Result};
use super::handler::{HandlerRegistry, StatusCheck};
use super::store::RetryingStore;
use crate::core::{ActionRecord, ActionStatus, RunState};
use crate::plan::Plan;
use crate::storage::{Cas, StateStore, TransitionMetadata};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How an invocation found its run.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    /// No state existed; a new pending run was created.
    Fresh(RunState),
    /// The run was already in progress.
    Resumed(RunState),
    /// The run already reached a terminal status. Nothing is left to do.
    Finished(RunState),
}

impl Resumption {
    pub fn state(&self) -> &RunState {
        match self {
            Resumption::Fresh(s) | Resumption::Resumed(s) | Resumption::Finished(s) => s,
        }
    }

    pub fn into_state(self) -> RunState {
        match self {
            Resumption::Fresh(s) | Resumption::Resumed(s) | Resumption::Finished(s) => s,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Resumption::Finished(_))
    }
}

pub struct Resumer<S: ?Sized> {
    store: RetryingStore<S>,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
}

impl<S: ?Sized> Clone for Resumer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: StateStore + ?Sized> Resumer<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            store: RetryingStore::new(store, config.store_retry),
            registry,
            config,
        }
    }

    /// Loads the run, creating it if this is its first invocation.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Incompatible`] if the stored run was created from a
    /// plan with a different fingerprint.
    pub async fn resume(&self, run_id: Uuid, plan: &Plan) -> Result<Resumption> {
        let plan_hash = plan.fingerprint()?;

        let state = match self.store.get(run_id).await? {
            Some(state) => state,
            None => {
                let fresh = RunState::new(
                    run_id,
                    plan.name.clone(),
                    plan_hash,
                    plan.actions
                        .iter()
                        .map(|a| (a.id.clone(), a.action_type.clone())),
                );
                match self.store.create(&fresh).await? {
                    Cas::Applied(state) => {
                        info!(%run_id, plan = %plan.name, actions = state.actions.len(), "created run");
                        return Ok(Resumption::Fresh(state));
                    }
                    // another invocation created it first
                    Cas::Conflict(existing) => existing,
                }
            }
        };

        if state.run.plan_hash != plan_hash {
            return Err(ExecutionError::Incompatible {
                run_id,
                reason: format!(
                    "stored plan fingerprint {:016x} does not match {:016x}",
                    state.run.plan_hash, plan_hash
                ),
            });
        }

        if state.run.status.is_terminal() {
            info!(%run_id, status = %state.run.status, "run already finished");
            return Ok(Resumption::Finished(state));
        }

        let reclaimed = self.reclaim_stale(plan, &state).await?;
        let state = if reclaimed > 0 {
            self.store.load(run_id).await?
        } else {
            state
        };

        info!(%run_id, status = %state.run.status, reclaimed, "resuming run");
        Ok(Resumption::Resumed(state))
    }

    /// Reclaims every `running` action in `state` whose last update is older
    /// than the staleness threshold. Returns how many were moved.
    ///
    /// The handler's `check_status` decides where a reclaimed action goes:
    /// `complete` or `failed` when it knows, back to `pending` otherwise.
    pub async fn reclaim_stale(&self, plan: &Plan, state: &RunState) -> Result<usize> {
        let run_id = state.run_id();
        let threshold = self.config.stale_threshold();
        let mut reclaimed = 0;

        for record in state.actions.values() {
            if record.status != ActionStatus::Running {
                continue;
            }
            let age = age_of(record);
            if age < threshold {
                debug!(%run_id, action_id = %record.id, ?age, "running action is live");
                continue;
            }

            let check = match plan
                .action(&record.id)
                .zip(self.registry.get(&record.action_type))
            {
                Some((action, handler)) => {
                    match tokio::time::timeout(
                        self.config.action_timeout,
                        handler.check_status(&action.params),
                    )
                    .await
                    {
                        Ok(check) => check,
                        Err(_) => StatusCheck::Unknown,
                    }
                }
                None => StatusCheck::Unknown,
            };

            let (next, metadata) = match check {
                StatusCheck::Complete(output) => (
                    ActionStatus::Complete,
                    TransitionMetadata::new().with_output(output),
                ),
                StatusCheck::Failed(reason) => (
                    ActionStatus::Failed,
                    TransitionMetadata::new().with_error(reason),
                ),
                StatusCheck::Unknown => (
                    ActionStatus::Pending,
                    TransitionMetadata::new().with_error(format!(
                        "reclaimed after {}s without progress",
                        age.as_secs()
                    )),
                ),
            };

            match self
                .store
                .set_action(run_id, &record.id, ActionStatus::Running, next, metadata)
                .await?
            {
                Cas::Applied(_) => {
                    warn!(%run_id, action_id = %record.id, ?age, status = %next, "reclaimed stale action");
                    reclaimed += 1;
                }
                Cas::Conflict(current) => {
                    debug!(%run_id, action_id = %record.id, status = %current.status, "stale action moved on");
                }
            }
        }

        Ok(reclaimed)
    }
}

/// Time since the record was last written. A record stamped in the future
/// (clock skew between invocations) counts as fresh.
fn age_of(record: &ActionRecord) -> Duration {
    (Utc::now() - record.updated_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
