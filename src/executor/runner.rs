//! ActionRunner - drives one action through its attempts, or through its
//! compensation.
//!
//! Every transition is persisted before the runner moves on, and every
//! transition is a compare-and-set. The attempt loop is an explicit state
//! machine (persisted attempt counter plus per-attempt deadline), so a
//! runner started by a later invocation continues where an interrupted one
//! stopped instead of starting the budget over.

use super::config::EngineConfig;
use super::error::Result;
use super::handler::{ActionHandler, HandlerOutcome, RollbackOutcome};
use super::store::RetryingStore;
use crate::core::{ActionRecord, ActionStatus, RollbackFailure};
use crate::plan::ActionDefinition;
use crate::storage::{Cas, StateStore, TransitionMetadata};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal result of running one action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Complete(ActionRecord),
    Failed(ActionRecord),
    /// Another runner claimed or settled the action first. Nothing was
    /// executed by this runner.
    Conflict(ActionRecord),
}

impl ActionOutcome {
    pub fn record(&self) -> &ActionRecord {
        match self {
            ActionOutcome::Complete(r) | ActionOutcome::Failed(r) | ActionOutcome::Conflict(r) => r,
        }
    }
}

/// Result of compensating one action.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackResult {
    RolledBack(ActionRecord),
    /// The handler's rollback failed or timed out. The failure has been
    /// recorded on the run.
    Failed(ActionRecord, String),
    /// Another sweep got to the action first.
    Conflict(ActionRecord),
}

/// Result of one handler attempt.
enum Attempt {
    Success(serde_json::Value),
    Fail(String),
    Transient(String),
}

pub struct ActionRunner<S: ?Sized> {
    store: RetryingStore<S>,
    config: Arc<EngineConfig>,
}

impl<S: ?Sized> Clone for ActionRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: StateStore + ?Sized> ActionRunner<S> {
    pub fn new(store: Arc<S>, config: Arc<EngineConfig>) -> Self {
        Self {
            store: RetryingStore::new(store, config.store_retry),
            config,
        }
    }

    /// Claims the action (`expected` must be `Pending` or `Ready`) and runs
    /// its handler until it completes, fails, or exhausts its attempts.
    ///
    /// Losing the claim, here or between attempts, returns
    /// [`ActionOutcome::Conflict`] without calling the handler again.
    pub async fn run(
        &self,
        run_id: Uuid,
        action: &ActionDefinition,
        handler: &dyn ActionHandler,
        expected: ActionStatus,
    ) -> Result<ActionOutcome> {
        let claim = Uuid::new_v4();
        let max_attempts = self.config.retry.attempts();

        let mut record = match self
            .store
            .set_action(
                run_id,
                &action.id,
                expected,
                ActionStatus::Running,
                TransitionMetadata::new().with_claim(claim),
            )
            .await?
        {
            Cas::Applied(record) => record,
            Cas::Conflict(current) => {
                debug!(status = %current.status, "action already claimed, skipping");
                return Ok(ActionOutcome::Conflict(current));
            }
        };

        info!(attempts = record.attempts, "action claimed");

        let mut carried_error: Option<String> = None;
        loop {
            if record.attempts >= max_attempts {
                let reason = format!(
                    "attempts exhausted ({}/{}): {}",
                    record.attempts,
                    max_attempts,
                    carried_error
                        .as_deref()
                        .or(record.last_error.as_deref())
                        .unwrap_or("interrupted")
                );
                return self.finish_failed(run_id, action, claim, reason).await;
            }

            let attempt = record.attempts + 1;
            let mut metadata = TransitionMetadata::new()
                .with_claim(claim)
                .with_attempts(attempt);
            if let Some(error) = carried_error.take() {
                metadata = metadata.with_error(error);
            }

            record = match self
                .store
                .set_action(run_id, &action.id, ActionStatus::Running, ActionStatus::Running, metadata)
                .await?
            {
                Cas::Applied(record) => record,
                Cas::Conflict(current) => {
                    warn!(attempt, status = %current.status, "lost claim before attempt");
                    return Ok(ActionOutcome::Conflict(current));
                }
            };

            debug!(attempt, max_attempts, "executing action");
            match self.attempt(handler, &action.params).await {
                Attempt::Success(output) => {
                    return self.finish_complete(run_id, action, claim, output).await;
                }
                Attempt::Fail(reason) => {
                    warn!(attempt, %reason, "action failed");
                    return self.finish_failed(run_id, action, claim, reason).await;
                }
                Attempt::Transient(reason) => match self.config.retry.delay_for_attempt(attempt) {
                    Some(delay) => {
                        warn!(attempt, max_attempts, ?delay, %reason, "transient failure, retrying");
                        tokio::time::sleep(delay).await;
                        carried_error = Some(reason);
                    }
                    None => {
                        let reason = format!(
                            "attempts exhausted ({}/{}): {}",
                            attempt, max_attempts, reason
                        );
                        warn!(attempt, %reason, "action failed");
                        return self.finish_failed(run_id, action, claim, reason).await;
                    }
                },
            }
        }
    }

    async fn attempt(&self, handler: &dyn ActionHandler, params: &serde_json::Value) -> Attempt {
        let timeout = self.config.action_timeout;
        match tokio::time::timeout(timeout, handler.execute(params)).await {
            Ok(HandlerOutcome::Success(output)) => Attempt::Success(output),
            Ok(HandlerOutcome::Fail(reason)) => Attempt::Fail(reason),
            Ok(HandlerOutcome::Transient(reason)) => Attempt::Transient(reason),
            Err(_) => Attempt::Transient(format!("timed out after {:?}", timeout)),
        }
    }

    async fn finish_complete(
        &self,
        run_id: Uuid,
        action: &ActionDefinition,
        claim: Uuid,
        output: serde_json::Value,
    ) -> Result<ActionOutcome> {
        let metadata = TransitionMetadata::new()
            .with_claim(claim)
            .with_output(output);

        match self
            .store
            .set_action(run_id, &action.id, ActionStatus::Running, ActionStatus::Complete, metadata)
            .await?
        {
            Cas::Applied(record) => {
                info!(attempts = record.attempts, "action complete");
                Ok(ActionOutcome::Complete(record))
            }
            Cas::Conflict(current) => {
                warn!(status = %current.status, "lost claim before recording completion");
                Ok(ActionOutcome::Conflict(current))
            }
        }
    }

    async fn finish_failed(
        &self,
        run_id: Uuid,
        action: &ActionDefinition,
        claim: Uuid,
        reason: String,
    ) -> Result<ActionOutcome> {
        let metadata = TransitionMetadata::new().with_claim(claim).with_error(reason);

        match self
            .store
            .set_action(run_id, &action.id, ActionStatus::Running, ActionStatus::Failed, metadata)
            .await?
        {
            Cas::Applied(record) => Ok(ActionOutcome::Failed(record)),
            Cas::Conflict(current) => {
                warn!(status = %current.status, "lost claim before recording failure");
                Ok(ActionOutcome::Conflict(current))
            }
        }
    }

    /// Compensates an action that is `Complete`, or resumes compensating one
    /// left `RollingBack` by an interrupted sweep.
    ///
    /// A rollback failure is recorded on the action (`Failed`) and on the
    /// run's rollback failure list; it is not an error.
    pub async fn roll_back(
        &self,
        run_id: Uuid,
        action: &ActionDefinition,
        handler: &dyn ActionHandler,
        record: &ActionRecord,
    ) -> Result<RollbackResult> {
        if record.status == ActionStatus::Complete {
            if let Cas::Conflict(current) = self
                .store
                .set_action(
                    run_id,
                    &action.id,
                    ActionStatus::Complete,
                    ActionStatus::RollingBack,
                    TransitionMetadata::new(),
                )
                .await?
            {
                debug!(status = %current.status, "rollback already handled elsewhere");
                return Ok(RollbackResult::Conflict(current));
            }
        }

        let timeout = self.config.rollback_timeout;
        let outcome = match tokio::time::timeout(
            timeout,
            handler.rollback(&action.params, record.output.as_ref()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => RollbackOutcome::Fail(format!("rollback timed out after {:?}", timeout)),
        };

        match outcome {
            RollbackOutcome::Success => {
                match self
                    .store
                    .set_action(
                        run_id,
                        &action.id,
                        ActionStatus::RollingBack,
                        ActionStatus::RolledBack,
                        TransitionMetadata::new(),
                    )
                    .await?
                {
                    Cas::Applied(record) => {
                        info!("action rolled back");
                        Ok(RollbackResult::RolledBack(record))
                    }
                    Cas::Conflict(current) => Ok(RollbackResult::Conflict(current)),
                }
            }
            RollbackOutcome::Fail(reason) => {
                warn!(%reason, "rollback failed");
                // Recorded before the action leaves RollingBack, so a store
                // error here leaves it for the next sweep to retry.
                self.store
                    .record_rollback_failure(
                        run_id,
                        RollbackFailure {
                            action_id: action.id.clone(),
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                match self
                    .store
                    .set_action(
                        run_id,
                        &action.id,
                        ActionStatus::RollingBack,
                        ActionStatus::Failed,
                        TransitionMetadata::new().with_error(reason.clone()),
                    )
                    .await?
                {
                    Cas::Applied(record) => Ok(RollbackResult::Failed(record, reason)),
                    Cas::Conflict(current) => Ok(RollbackResult::Conflict(current)),
                }
            }
        }
    }
}
