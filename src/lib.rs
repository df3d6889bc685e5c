//! Actiongraph: a resumable action-graph execution engine
//!
//! `actiongraph` runs a plan, a graph of named actions with declared
//! dependencies, against an external state store. It dispatches actions as
//! their dependencies complete, retries transient failures, and on an
//! unrecoverable failure compensates everything that completed, in reverse
//! dependency order.
//!
//! One invocation drives one run as far as it can. The run's state lives in
//! the store, so a later invocation (after a time-limit truncation, a crash,
//! or a deliberate time budget) adopts the run and continues from the last
//! persisted transition instead of starting over.
//!
//! # Features
//!
//! - **Validated plans**: unknown references and cycles are rejected before
//!   any action runs
//! - **Bounded concurrency**: independent actions run in parallel up to a limit
//! - **Retry logic**: per-action attempt budget with exponential backoff
//! - **Compensating rollback**: reverse topological sweep that attempts every
//!   completed action even when some compensations fail
//! - **Cross-invocation safety**: every transition is a compare-and-set, so a
//!   stale invocation can never double-execute an action
//!
//! # Quick Start
//!
//! ```
//! use actiongraph::prelude::*;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//!
//! struct CreateBucket;
//!
//! #[async_trait]
//! impl ActionHandler for CreateBucket {
//!     async fn execute(&self, params: &Value) -> HandlerOutcome {
//!         HandlerOutcome::Success(json!({"arn": format!("arn:bucket:{}", params["name"])}))
//!     }
//!
//!     async fn rollback(&self, _params: &Value, _prior: Option<&Value>) -> RollbackOutcome {
//!         RollbackOutcome::Success
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = Plan::from_yaml(
//!     r#"
//! name: storage
//! actions:
//!   - id: bucket
//!     type: Bucket::Create
//!     params: { name: logs }
//!   - id: done
//!     type: System::NoOp
//!     depends_on: [bucket]
//! "#,
//! )?;
//!
//! let registry = HandlerRegistry::with_builtins().with_handler("Bucket::Create", CreateBucket);
//! let executor = Executor::new(Arc::new(InMemoryStateStore::new()), registry);
//!
//! let report = executor.invoke(Uuid::new_v4(), &plan).await?;
//! assert_eq!(report.status, RunStatus::Succeeded);
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! Each module hides a design decision that is likely to change:
//!
//! - [`core`]: statuses, records, retry policy (hides the serialized shape)
//! - [`graph`]: the dependency DAG (hides the graph representation)
//! - [`plan`]: the plan document (hides the document format)
//! - [`storage`]: the state store (hides the database and its schema)
//! - [`executor`]: handlers, runner, engine, resumer (hides the scheduling strategy)

pub mod core;
pub mod executor;
pub mod graph;
pub mod plan;
pub mod storage;

pub use core::{
    ActionRecord, ActionStatus, CoreError, Result as CoreResult, RetryPolicy, RollbackFailure,
    Run, RunState, RunStatus,
};

pub use executor::{
    request_cancel, ActionHandler, ActionOutcome, ActionRunner, EngineConfig, ExecutionEngine,
    ExecutionError, Executor, HandlerOutcome, HandlerRegistry, Result as ExecutionResult,
    Resumer, Resumption, Retryable, RollbackOutcome, RunReport, StatusCheck,
};

pub use graph::{ActionId, DependencyGraph, GraphError, GraphResult};

pub use plan::{ActionDefinition, Plan};

pub use storage::{
    Cas, InMemoryStateStore, Result as StorageResult, StateStore, StorageError,
    TransitionMetadata,
};

#[cfg(feature = "sqlite")]
pub use storage::{PoolConfig, SqliteStateStore};

// Re-export dependencies used in public API so users don't hit version mismatches
pub use serde;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use actiongraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{ActionStatus, RetryPolicy, RunStatus};

    pub use crate::executor::{
        request_cancel, ActionHandler, EngineConfig, ExecutionError, Executor, HandlerOutcome,
        HandlerRegistry, RollbackOutcome, RunReport, StatusCheck, NO_OP, SET_VARIABLES,
    };

    pub use crate::graph::{ActionId, GraphError};

    pub use crate::plan::{ActionDefinition, Plan};

    pub use crate::storage::{InMemoryStateStore, StateStore};

    #[cfg(feature = "sqlite")]
    pub use crate::storage::SqliteStateStore;

    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
    pub use uuid::Uuid;
}
