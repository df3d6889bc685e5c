//! The invocation entry point.

use super::config::EngineConfig;
use super::engine::{ExecutionEngine, RunReport};
use super::error::{ExecutionError, Result};
use super::handler::HandlerRegistry;
use super::resumer::Resumer;
use crate::core::RunStatus;
use crate::graph::DependencyGraph;
use crate::plan::Plan;
use crate::storage::{Cas, StateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runs plans against a state store.
///
/// One call to [`Executor::invoke`] is one invocation: it creates or adopts
/// the run, reclaims abandoned actions, and drives the run as far as the
/// time budget allows. Call it again with the same run id until the report
/// says the run is finished.
///
/// # Example
///
/// ```
/// use actiongraph::prelude::*;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let plan = Plan::new("bootstrap")
///     .with_action(ActionDefinition::new("vars", SET_VARIABLES)
///         .with_params(serde_json::json!({"Variables": {"env": "prod"}})))
///     .with_action(ActionDefinition::new("done", NO_OP).depends_on(["vars"]));
///
/// let executor = Executor::new(Arc::new(InMemoryStateStore::new()), HandlerRegistry::with_builtins());
/// let report = executor.invoke(Uuid::new_v4(), &plan).await?;
///
/// assert!(report.is_success());
/// # Ok(())
/// # }
/// ```
pub struct Executor<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
}

impl<S: StateStore + ?Sized + 'static> Executor<S> {
    pub fn new(store: Arc<S>, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config: Arc::new(EngineConfig::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels invocations of this executor.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates a plan without touching the store.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Validation`] for a cycle or an unresolved reference,
    /// [`ExecutionError::UnknownActionType`] for an action with no handler.
    pub fn validate(&self, plan: &Plan) -> Result<DependencyGraph> {
        let graph = plan.graph()?;
        if let Some(action) = plan
            .actions
            .iter()
            .find(|a| !self.registry.contains(&a.action_type))
        {
            return Err(ExecutionError::UnknownActionType {
                action_id: action.id.clone(),
                action_type: action.action_type.clone(),
            });
        }
        Ok(graph)
    }

    /// Runs one invocation of `run_id` over `plan`.
    ///
    /// Validation happens before the store is touched, so an invalid plan
    /// never creates a run and never calls a handler. Re-invoking a finished
    /// run returns its report without any transition.
    pub async fn invoke(&self, run_id: Uuid, plan: &Plan) -> Result<RunReport> {
        let span = info_span!("invocation", %run_id, plan = %plan.name);
        async move {
            let graph = match self.validate(plan) {
                Ok(graph) => graph,
                Err(e) => {
                    warn!(error = %e, "plan rejected");
                    return Err(e);
                }
            };

            let resumer = Resumer::new(self.store.clone(), self.registry.clone(), self.config.clone());
            let resumption = resumer.resume(run_id, plan).await?;
            if resumption.is_finished() {
                return Ok(RunReport::from_state(resumption.into_state()));
            }

            ExecutionEngine::new(self.store.clone(), self.registry.clone(), self.config.clone())
                .with_cancellation(self.cancel.clone())
                .execute(plan, &graph, resumption.into_state())
                .await
        }
        .instrument(span)
        .await
    }
}

/// Asks a run to stop, from any process sharing the store.
///
/// Moves a pending or running run to `cancelled`. Engines driving the run
/// see it on their next state read, stop dispatching and roll back. Returns
/// the run status after the call; a run that already stopped is left as is.
pub async fn request_cancel<S: StateStore + ?Sized>(store: &S, run_id: Uuid) -> Result<RunStatus> {
    let mut status = store
        .get(run_id)
        .await?
        .ok_or(ExecutionError::RunNotFound(run_id))?
        .run
        .status;

    while matches!(status, RunStatus::Pending | RunStatus::Running) {
        match store
            .conditional_set_run(run_id, status, RunStatus::Cancelled)
            .await?
        {
            Cas::Applied(run) => {
                info!(%run_id, from = %status, "cancellation requested");
                return Ok(run.status);
            }
            Cas::Conflict(run) => status = run.status,
        }
    }

    Ok(status)
}
