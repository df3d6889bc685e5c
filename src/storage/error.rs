use crate::core::CoreError;
use crate::graph::ActionId;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type.
///
/// A lost compare-and-set is not an error; it is reported as
/// [`super::Cas::Conflict`]. These variants cover the store itself failing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// A record could not be encoded, decoded, or violated a state machine.
    #[error("core error")]
    Core(#[from] CoreError),

    /// Connecting to the backing store failed.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("action not found: run_id={run_id}, action_id={action_id}")]
    ActionNotFound { run_id: Uuid, action_id: ActionId },

    /// A stored row could not be mapped back to a record.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
