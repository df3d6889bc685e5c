use super::status::{ActionStatus, RunStatus};
use crate::graph::ActionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Persisted state of one action within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub action_type: String,
    pub status: ActionStatus,
    /// Execute attempts made so far, across invocations.
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Output of the successful execute, handed to rollback.
    #[serde(default)]
    pub output: Option<Value>,
    /// Token of the runner currently holding the action. Only set while running.
    #[serde(default)]
    pub claim: Option<Uuid>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(id: ActionId, action_type: impl Into<String>) -> Self {
        Self {
            id,
            action_type: action_type.into(),
            status: ActionStatus::Pending,
            attempts: 0,
            last_error: None,
            output: None,
            claim: None,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Run-level record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    /// Name of the plan this run executes.
    pub plan_ref: String,
    /// Fingerprint of the plan document; a resumed invocation must match it.
    pub plan_hash: u64,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A compensating action that failed during the rollback sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub action_id: ActionId,
    pub reason: String,
}

/// Everything persisted for a run. This is the only input a resumed
/// invocation needs besides the plan itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run: Run,
    pub actions: BTreeMap<ActionId, ActionRecord>,
    #[serde(default)]
    pub rollback_failures: Vec<RollbackFailure>,
}

impl RunState {
    /// Creates a pending run with every action pending.
    pub fn new<I>(run_id: Uuid, plan_ref: impl Into<String>, plan_hash: u64, actions: I) -> Self
    where
        I: IntoIterator<Item = (ActionId, String)>,
    {
        let now = Utc::now();
        let actions = actions
            .into_iter()
            .map(|(id, action_type)| (id.clone(), ActionRecord::new(id, action_type)))
            .collect();

        Self {
            run: Run {
                run_id,
                plan_ref: plan_ref.into(),
                plan_hash,
                status: RunStatus::Pending,
                created_at: now,
                updated_at: now,
            },
            actions,
            rollback_failures: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    pub fn status_of(&self, id: &ActionId) -> Option<ActionStatus> {
        self.actions.get(id).map(|a| a.status)
    }

    /// Status of every action, the input to readiness computation.
    pub fn statuses(&self) -> BTreeMap<ActionId, ActionStatus> {
        self.actions
            .iter()
            .map(|(id, record)| (id.clone(), record.status))
            .collect()
    }

    /// Ids of all actions currently in `status`, ascending.
    pub fn in_status(&self, status: ActionStatus) -> Vec<ActionId> {
        self.actions
            .values()
            .filter(|a| a.status == status)
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn all_complete(&self) -> bool {
        self.actions
            .values()
            .all(|a| a.status == ActionStatus::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RunState {
        RunState::new(
            Uuid::new_v4(),
            "deploy",
            42,
            vec![
                (ActionId::new("b"), "System::NoOp".to_string()),
                (ActionId::new("a"), "System::NoOp".to_string()),
            ],
        )
    }

    #[test]
    fn test_new_run_state_is_pending() {
        let state = state();
        assert_eq!(state.run.status, RunStatus::Pending);
        assert_eq!(state.actions.len(), 2);
        assert!(state
            .actions
            .values()
            .all(|a| a.status == ActionStatus::Pending && a.attempts == 0));
        assert!(!state.all_complete());
    }

    #[test]
    fn test_in_status_is_sorted() {
        let state = state();
        assert_eq!(
            state.in_status(ActionStatus::Pending),
            vec![ActionId::new("a"), ActionId::new("b")]
        );
    }

    #[test]
    fn test_run_state_json_round_trip() {
        let mut state = state();
        state.rollback_failures.push(RollbackFailure {
            action_id: ActionId::new("a"),
            reason: "bucket not empty".into(),
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
