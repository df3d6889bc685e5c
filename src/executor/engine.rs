//! ExecutionEngine - orchestrates a whole run.
//!
//! The engine never keeps authoritative state in memory across a suspension
//! point. Each pass of the dispatch loop re-reads the run from the store,
//! computes readiness from what it read, and dispatches; every effect goes
//! through a compare-and-set, so a stale invocation racing this one loses
//! cleanly instead of corrupting the run.
//!
//! ```text
//! pending -> running -> succeeded
//!               |
//!               +-> failed | cancelled -> rolling-back -> rolled-back
//! ```

use super::config::EngineConfig;
use super::error::{ExecutionError, Result};
use super::handler::HandlerRegistry;
use super::resumer::Resumer;
use super::runner::{ActionOutcome, ActionRunner, RollbackResult};
use super::store::RetryingStore;
use crate::core::{ActionRecord, ActionStatus, RollbackFailure, RunState, RunStatus};
use crate::graph::{ActionId, DependencyGraph};
use crate::plan::Plan;
use crate::storage::{Cas, StateStore, TransitionMetadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What an invocation hands back to its caller.
///
/// `status` is always the status read back from the store after the engine
/// stopped. A run still `running` (the time budget ran out) or
/// `rolling-back` must be invoked again; only `succeeded` is success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Actions whose compensation failed, for operator remediation.
    pub rollback_failures: Vec<RollbackFailure>,
    pub actions: BTreeMap<ActionId, ActionRecord>,
}

impl RunReport {
    pub fn from_state(state: RunState) -> Self {
        Self {
            run_id: state.run.run_id,
            status: state.run.status,
            rollback_failures: state.rollback_failures,
            actions: state.actions,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// True once nothing is left for a later invocation to do.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn action(&self, id: &str) -> Option<&ActionRecord> {
        self.actions.get(id)
    }
}

type TaskResult = (ActionId, Result<ActionOutcome>);

pub struct ExecutionEngine<S: ?Sized> {
    store: RetryingStore<S>,
    runner: ActionRunner<S>,
    resumer: Resumer<S>,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
}

impl<S: StateStore + ?Sized + 'static> ExecutionEngine<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            store: RetryingStore::new(store.clone(), config.store_retry),
            runner: ActionRunner::new(store.clone(), config.clone()),
            resumer: Resumer::new(store, registry.clone(), config.clone()),
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `token` stops new dispatch; in-flight actions finish and
    /// the run is rolled back.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Drives the run from `state` as far as this invocation can take it.
    ///
    /// `graph` must be the validated graph of `plan`. A run already in a
    /// terminal status is returned as is, without touching the store.
    pub async fn execute(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        state: RunState,
    ) -> Result<RunReport> {
        let run_id = state.run_id();
        if state.run.status.is_terminal() {
            debug!(%run_id, status = %state.run.status, "run already finished");
            return Ok(RunReport::from_state(state));
        }

        // A budget too large to represent as an instant means no deadline.
        let deadline = self
            .config
            .time_budget
            .and_then(|budget| Instant::now().checked_add(budget));

        let mut status = state.run.status;
        if status == RunStatus::Pending {
            status = self
                .store
                .set_run(run_id, RunStatus::Pending, RunStatus::Running)
                .await?
                .into_inner()
                .status;
            info!(%run_id, %status, "run started");
        }

        if status == RunStatus::Running {
            self.dispatch(plan, graph, run_id, deadline).await?;
        }

        let state = self.store.load(run_id).await?;
        if state.run.status.needs_rollback() {
            self.roll_back(plan, graph, state, deadline).await?;
        }

        let report = RunReport::from_state(self.store.load(run_id).await?);
        info!(
            %run_id,
            status = %report.status,
            rollback_failures = report.rollback_failures.len(),
            "invocation finished"
        );
        Ok(report)
    }

    /// The dispatch loop. Returns once nothing is in flight and either the
    /// run left `running`, or dispatch halted (cancellation, failure, time
    /// budget).
    async fn dispatch(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        run_id: Uuid,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency()));
        let mut in_flight: JoinSet<TaskResult> = JoinSet::new();
        let mut dispatched: HashSet<ActionId> = HashSet::new();
        let mut halted = false;
        let mut fatal: Option<ExecutionError> = None;

        loop {
            let state = match self.store.load(run_id).await {
                Ok(state) => state,
                Err(e) => {
                    error!(%run_id, error = %e, "failed to read run state, draining");
                    fatal.get_or_insert(e);
                    drain(&mut in_flight).await;
                    break;
                }
            };

            if !halted {
                if let Err(e) = self.check_halt(&state, deadline, &mut halted).await {
                    fatal.get_or_insert(e);
                    halted = true;
                }
            }

            if !halted {
                if let Err(e) = self
                    .dispatch_ready(plan, graph, &state, &semaphore, &mut in_flight, &mut dispatched)
                    .await
                {
                    fatal.get_or_insert(e);
                    halted = true;
                }
            }

            if in_flight.is_empty() {
                // a run whose last action finished right at the deadline still succeeds
                if state.all_complete() && fatal.is_none() {
                    if let Cas::Applied(_) = self
                        .store
                        .set_run(run_id, RunStatus::Running, RunStatus::Succeeded)
                        .await?
                    {
                        info!(%run_id, actions = state.actions.len(), "run succeeded");
                    }
                    break;
                }
                if halted {
                    break;
                }
                if !state.in_status(ActionStatus::Running).is_empty() {
                    // another invocation holds the remaining work
                    if self.resumer.reclaim_stale(plan, &state).await? == 0 {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                    continue;
                }
                error!(%run_id, "no pending action can become ready, failing run");
                self.store
                    .set_run(run_id, RunStatus::Running, RunStatus::Failed)
                    .await?;
                continue;
            }

            let Some(joined) = in_flight.join_next().await else {
                continue;
            };
            match joined {
                Ok((action_id, result)) => {
                    dispatched.remove(&action_id);
                    if let Err(e) = self.fold(run_id, &action_id, result).await {
                        fatal.get_or_insert(e);
                        halted = true;
                    }
                }
                Err(e) => {
                    error!(%run_id, error = %e, "action task aborted");
                    fatal.get_or_insert(ExecutionError::TaskPanic(e.to_string()));
                    halted = true;
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sets `halted` when dispatch must stop, moving the run to `cancelled`
    /// or `failed` when this invocation is the one that noticed why.
    async fn check_halt(
        &self,
        state: &RunState,
        deadline: Option<Instant>,
        halted: &mut bool,
    ) -> Result<()> {
        let run_id = state.run_id();

        if state.run.status != RunStatus::Running {
            info!(%run_id, status = %state.run.status, "run no longer running, halting dispatch");
            *halted = true;
        } else if self.cancel.is_cancelled() {
            warn!(%run_id, "cancellation requested, halting dispatch");
            *halted = true;
            self.store
                .set_run(run_id, RunStatus::Running, RunStatus::Cancelled)
                .await?;
        } else if let Some(failed) = state.in_status(ActionStatus::Failed).first() {
            warn!(%run_id, action_id = %failed, "action failed, halting dispatch");
            *halted = true;
            self.store
                .set_run(run_id, RunStatus::Running, RunStatus::Failed)
                .await?;
        } else if past(deadline) {
            info!(%run_id, "time budget exhausted, halting dispatch");
            *halted = true;
        }

        Ok(())
    }

    /// Dispatches every ready action a concurrency slot is free for. Ready
    /// actions left over are marked `ready` so the state shows them queued.
    async fn dispatch_ready(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        state: &RunState,
        semaphore: &Arc<Semaphore>,
        in_flight: &mut JoinSet<TaskResult>,
        dispatched: &mut HashSet<ActionId>,
    ) -> Result<()> {
        let run_id = state.run_id();
        let statuses = state.statuses();

        let mut candidates: Vec<(ActionId, ActionStatus)> = state
            .in_status(ActionStatus::Ready)
            .into_iter()
            .filter(|id| graph.dependencies_complete(id, &statuses))
            .map(|id| (id, ActionStatus::Ready))
            .chain(
                graph
                    .ready_actions(&statuses)
                    .into_iter()
                    .map(|id| (id, ActionStatus::Pending)),
            )
            .filter(|(id, _)| !dispatched.contains(id))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        for (action_id, expected) in candidates {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                if expected == ActionStatus::Pending {
                    self.store
                        .set_action(
                            run_id,
                            &action_id,
                            ActionStatus::Pending,
                            ActionStatus::Ready,
                            TransitionMetadata::new(),
                        )
                        .await?;
                    debug!(%run_id, %action_id, "action queued for a free slot");
                }
                continue;
            };

            let action = plan
                .action(&action_id)
                .ok_or_else(|| ExecutionError::Incompatible {
                    run_id,
                    reason: format!("stored action '{}' is not in the plan", action_id),
                })?
                .clone();
            let handler = self.registry.get(&action.action_type).ok_or_else(|| {
                ExecutionError::UnknownActionType {
                    action_id: action_id.clone(),
                    action_type: action.action_type.clone(),
                }
            })?;

            let span = info_span!(
                "action",
                %run_id,
                action_id = %action.id,
                action_type = %action.action_type
            );
            let runner = self.runner.clone();
            let task = async move {
                runner
                    .run(run_id, &action, handler.as_ref(), expected)
                    .await
            }
            .instrument(span);

            let id = action_id.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                // a panicking handler must not take the engine down with it
                let result = match tokio::spawn(task).await {
                    Ok(result) => result,
                    Err(e) => Err(ExecutionError::TaskPanic(e.to_string())),
                };
                (id, result)
            });
            dispatched.insert(action_id);
        }

        Ok(())
    }

    /// Folds one finished action into the run. Action failures are picked up
    /// by the next halt check; only engine errors are returned.
    async fn fold(
        &self,
        run_id: Uuid,
        action_id: &ActionId,
        result: Result<ActionOutcome>,
    ) -> Result<()> {
        match result {
            Ok(ActionOutcome::Complete(record)) => {
                debug!(%run_id, %action_id, attempts = record.attempts, "action settled complete");
            }
            Ok(ActionOutcome::Failed(record)) => {
                warn!(
                    %run_id,
                    %action_id,
                    attempts = record.attempts,
                    error = record.last_error.as_deref().unwrap_or(""),
                    "action settled failed"
                );
            }
            Ok(ActionOutcome::Conflict(record)) => {
                debug!(%run_id, %action_id, status = %record.status, "action handled elsewhere");
            }
            Err(ExecutionError::TaskPanic(reason)) => {
                error!(%run_id, %action_id, %reason, "action handler panicked");
                self.store
                    .set_action(
                        run_id,
                        action_id,
                        ActionStatus::Running,
                        ActionStatus::Failed,
                        TransitionMetadata::new().with_error(format!("handler panicked: {}", reason)),
                    )
                    .await?;
            }
            Err(e) => {
                error!(%run_id, %action_id, error = %e, "action runner failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// The rollback sweep.
    ///
    /// Actions that never started are skipped, actions running elsewhere are
    /// waited for, then every completed action is compensated in reverse
    /// topological order, latest-finished first among independent ones. A
    /// failed compensation is recorded and the sweep goes on.
    async fn roll_back(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        state: RunState,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let run_id = state.run_id();
        let from = state.run.status;

        if from != RunStatus::RollingBack {
            let run = self
                .store
                .set_run(run_id, from, RunStatus::RollingBack)
                .await?
                .into_inner();
            if run.status != RunStatus::RollingBack {
                debug!(%run_id, status = %run.status, "run moved on before rollback");
                return Ok(());
            }
            info!(%run_id, %from, "rolling back run");
        }

        let state = loop {
            let state = self.store.load(run_id).await?;

            for (action_id, record) in &state.actions {
                let mut expected = record.status;
                while matches!(expected, ActionStatus::Pending | ActionStatus::Ready) {
                    match self
                        .store
                        .set_action(
                            run_id,
                            action_id,
                            expected,
                            ActionStatus::Skipped,
                            TransitionMetadata::new(),
                        )
                        .await?
                    {
                        Cas::Applied(_) => break,
                        Cas::Conflict(current) => expected = current.status,
                    }
                }
            }

            if state.in_status(ActionStatus::Running).is_empty() {
                break self.store.load(run_id).await?;
            }
            if past(deadline) {
                info!(%run_id, "time budget exhausted waiting for running actions");
                return Ok(());
            }
            if self.resumer.reclaim_stale(plan, &state).await? == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        let order = graph.reverse_topological_order_by(|id| {
            state.actions.get(id).and_then(|record| record.finished_at)
        });

        let mut failures = 0;
        for action_id in order {
            let Some(record) = state.actions.get(&action_id) else {
                continue;
            };
            if !matches!(record.status, ActionStatus::Complete | ActionStatus::RollingBack) {
                continue;
            }
            if past(deadline) {
                info!(%run_id, "time budget exhausted during rollback");
                return Ok(());
            }

            let Some(action) = plan.action(&action_id) else {
                continue;
            };
            let handler = self.registry.get(&action.action_type).ok_or_else(|| {
                ExecutionError::UnknownActionType {
                    action_id: action_id.clone(),
                    action_type: action.action_type.clone(),
                }
            })?;

            let span = info_span!("rollback", %run_id, %action_id);
            let result = self
                .runner
                .roll_back(run_id, action, handler.as_ref(), record)
                .instrument(span)
                .await?;
            if let RollbackResult::Failed(_, reason) = result {
                warn!(%run_id, %action_id, %reason, "compensation failed, continuing sweep");
                failures += 1;
            }
        }

        let state = self.store.load(run_id).await?;
        let unsettled = state.actions.values().any(|record| {
            matches!(
                record.status,
                ActionStatus::Pending
                    | ActionStatus::Ready
                    | ActionStatus::Running
                    | ActionStatus::Complete
                    | ActionStatus::RollingBack
            )
        });
        if unsettled {
            debug!(%run_id, "rollback incomplete, leaving run rolling back");
            return Ok(());
        }

        if let Cas::Applied(_) = self
            .store
            .set_run(run_id, RunStatus::RollingBack, RunStatus::RolledBack)
            .await?
        {
            info!(%run_id, failures, "run rolled back");
        }
        Ok(())
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Waits out every in-flight action, logging what they settled to.
async fn drain(in_flight: &mut JoinSet<TaskResult>) {
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok((action_id, Ok(outcome))) => {
                debug!(%action_id, status = %outcome.record().status, "drained action");
            }
            Ok((action_id, Err(e))) => warn!(%action_id, error = %e, "drained action failed"),
            Err(e) => warn!(error = %e, "drained action task aborted"),
        }
    }
}
