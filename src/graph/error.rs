//! Error types for graph construction and validation.

use super::ActionId;
use thiserror::Error;

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised while building or validating a dependency graph.
///
/// All of these are validation errors: they are reported before any action
/// runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The dependency relation contains a cycle. `cycle` lists the
    /// participants in edge order, with the first id repeated at the end.
    #[error("cycle detected in dependency graph: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<ActionId> },

    /// An action declares a dependency on an id that is not in the plan.
    #[error("action '{action}' depends on unknown action '{dependency}'")]
    UnknownDependency {
        action: ActionId,
        dependency: String,
    },

    /// Two actions share an id.
    #[error("duplicate action id: {action_id}")]
    DuplicateAction { action_id: ActionId },

    #[error("action not found: {action_id}")]
    ActionNotFound { action_id: ActionId },

    /// A plan document could not be turned into a graph.
    #[error("invalid plan: {reason}")]
    InvalidPlan { reason: String },
}

impl GraphError {
    pub fn cycle(cycle: Vec<ActionId>) -> Self {
        Self::CycleDetected { cycle }
    }

    pub fn unknown_dependency(action: ActionId, dependency: impl Into<String>) -> Self {
        Self::UnknownDependency {
            action,
            dependency: dependency.into(),
        }
    }

    pub fn duplicate_action(action_id: ActionId) -> Self {
        Self::DuplicateAction { action_id }
    }

    pub fn action_not_found(action_id: ActionId) -> Self {
        Self::ActionNotFound { action_id }
    }

    pub fn invalid_plan(reason: impl Into<String>) -> Self {
        Self::InvalidPlan {
            reason: reason.into(),
        }
    }
}

fn format_cycle(cycle: &[ActionId]) -> String {
    cycle
        .iter()
        .map(ActionId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
