use crate::core::CoreError;
use crate::graph::{ActionId, GraphError};
use crate::storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Execution layer error type.
///
/// These are the failures that prevent an invocation from producing a
/// definitive run status. Per-action failures are not errors at this level:
/// they are recorded on the action and folded into the returned run status.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The plan failed validation. Nothing was executed.
    #[error("plan validation failed")]
    Validation(#[from] GraphError),

    /// An action names a type with no registered handler. Nothing was executed.
    #[error("no handler registered for type '{action_type}' (action '{action_id}')")]
    UnknownActionType {
        action_id: ActionId,
        action_type: String,
    },

    /// A storage operation failed after exhausting the store retry policy.
    #[error("storage error")]
    Storage(#[from] StorageError),

    /// A core serialization error occurred.
    #[error("core error")]
    Core(#[from] CoreError),

    /// The stored run was created from a different plan.
    #[error("run {run_id} is incompatible with the plan: {reason}")]
    Incompatible { run_id: Uuid, reason: String },

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// An action task panicked.
    #[error("task panicked: {0}")]
    TaskPanic(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

// =============================================================================
// RETRYABLE ERROR TRAIT
// =============================================================================

/// Classifies an error as transient (worth retrying) or permanent.
///
/// Used by [`crate::core::retry_with_policy`] to decide whether a failed
/// store call is retried.
///
/// # Example
///
/// ```rust
/// use actiongraph::executor::Retryable;
///
/// #[derive(Debug)]
/// enum ApiError {
///     Throttled,
///     NotFound,
/// }
///
/// impl Retryable for ApiError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, ApiError::Throttled)
///     }
/// }
///
/// assert!(ApiError::Throttled.is_retryable());
/// ```
pub trait Retryable {
    /// Returns true if the error is transient and the operation should be retried.
    fn is_retryable(&self) -> bool;
}

/// Busy databases, pool timeouts and dropped connections are transient.
/// Missing records, corrupt rows and illegal transitions are not.
impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            StorageError::Database(e) => sqlx_is_transient(e),
            StorageError::Connection(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "sqlite")]
fn sqlx_is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

impl Retryable for ExecutionError {
    fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}
