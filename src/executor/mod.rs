//! Execution layer: handlers, the per-action runner, the run engine, and
//! the resume logic that ties invocations together.
//!
//! Module organization:
//! - `handler`: the capability each action type implements, and the registry
//! - `runner`: one action's attempt loop and its compensation
//! - `engine`: readiness, bounded dispatch, run status, the rollback sweep
//! - `resumer`: run adoption and reclaiming of abandoned actions
//! - `invoke`: the entry point tying the above into one invocation
//!
//! All of them share state only through the [`StateStore`](crate::storage::StateStore).

mod config;
mod engine;
mod error;
pub mod handler;
mod invoke;
mod resumer;
mod runner;
mod store;

pub use config::EngineConfig;
pub use engine::{ExecutionEngine, RunReport};
pub use error::{ExecutionError, Result, Retryable};
pub use handler::{
    ActionHandler, HandlerOutcome, HandlerRegistry, NoOpHandler, RollbackOutcome,
    SetVariablesHandler, StatusCheck, NO_OP, SET_VARIABLES,
};
pub use invoke::{request_cancel, Executor};
pub use resumer::{Resumer, Resumption};
pub use runner::{ActionOutcome, ActionRunner, RollbackResult};
