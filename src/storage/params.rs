use crate::core::{ActionRecord, ActionStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Metadata written together with an action status transition.
///
/// `None` fields leave the stored value untouched. The store maintains
/// `started_at`, `finished_at` and `updated_at` itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionMetadata {
    /// New attempt count.
    pub attempts: Option<u32>,
    /// Error detail to record as `last_error`.
    pub error: Option<String>,
    /// Handler output to keep for rollback.
    pub output: Option<Value>,
    /// Claim token of the caller. On entering `running` it becomes the
    /// action's claim; while running, a mismatching token is a conflict.
    pub claim: Option<Uuid>,
}

impl TransitionMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_claim(mut self, claim: Uuid) -> Self {
        self.claim = Some(claim);
        self
    }

    /// Returns false if the record is held under a different claim than the
    /// one presented. Callers without a claim (reclaim, rollback) always match.
    pub fn claim_matches(&self, record: &ActionRecord) -> bool {
        match (record.claim, self.claim) {
            (Some(held), Some(presented)) => held == presented,
            _ => true,
        }
    }

    /// Applies the transition to `record`. The caller has already checked
    /// the expected status and the claim.
    pub fn apply(self, record: &mut ActionRecord, next: ActionStatus, now: DateTime<Utc>) {
        let entering_running = next == ActionStatus::Running && record.status != ActionStatus::Running;

        record.status = next;
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(error) = self.error {
            record.last_error = Some(error);
        }
        if let Some(output) = self.output {
            record.output = Some(output);
        }

        if entering_running {
            record.claim = self.claim;
            record.started_at = Some(now);
            record.finished_at = None;
        } else if next != ActionStatus::Running {
            record.claim = None;
        }

        if matches!(
            next,
            ActionStatus::Complete | ActionStatus::Failed | ActionStatus::Skipped
        ) {
            record.finished_at = Some(now);
        }
        record.updated_at = now;
    }
}
