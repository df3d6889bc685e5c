//! Core types shared by every layer of the engine.
//!
//! # Domain Model
//! - [`ActionStatus`] / [`RunStatus`]: the two state machines
//! - [`ActionRecord`], [`Run`], [`RunState`]: the persisted projection
//!
//! # Retry Behavior
//! - [`RetryPolicy`]: attempt budget and exponential backoff
//! - [`retry_with_policy`]: bounded retry loop for transient store errors
//!
//! # Fingerprinting
//! - [`fingerprint`]: stable SeaHash of a plan document

mod error;
mod record;
pub mod retry;
mod serialization;
mod status;

pub use error::{CoreError, Result};
pub use record::{ActionRecord, RollbackFailure, Run, RunState};
pub use retry::{retry_with_policy, RetryPolicy};
pub use serialization::fingerprint;
pub use status::{ActionStatus, RunStatus};
